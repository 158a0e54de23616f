//! Intention classification for the latest chat turn.
//!
//! A single structured-output request labels the conversation with one
//! [`Intention`]. Classification never fails the turn: any network error,
//! missing or malformed output degrades to [`Intention::RandomMessage`].

use serde_json::{json, Value};
use std::sync::Arc;

use crate::models::Chat;
use crate::providers::{CompletionModel, CompletionRequest, OutputSchema};

/// What the user is trying to do with their latest message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Intention {
    Question,
    HostileMessage,
    RandomMessage,
    /// A label outside the known set. Routed like [`Intention::RandomMessage`].
    Unknown,
}

impl Intention {
    /// The labels the classification model may choose from.
    pub const KNOWN: [Intention; 3] = [
        Intention::Question,
        Intention::HostileMessage,
        Intention::RandomMessage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intention::Question => "question",
            Intention::HostileMessage => "hostile_message",
            Intention::RandomMessage => "random_message",
            Intention::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "question" => Intention::Question,
            "hostile_message" => Intention::HostileMessage,
            "random_message" | "random" => Intention::RandomMessage,
            _ => Intention::Unknown,
        }
    }
}

impl std::fmt::Display for Intention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON schema constraining the classifier output to the known labels.
fn intention_schema() -> OutputSchema {
    let labels: Vec<&str> = Intention::KNOWN.iter().map(|i| i.as_str()).collect();
    OutputSchema {
        name: "intention".to_string(),
        schema: json!({
            "type": "object",
            "properties": {
                "type": { "type": "string", "enum": labels }
            },
            "required": ["type"],
            "additionalProperties": false
        }),
    }
}

/// Read the label out of a structured classifier response.
fn parse_intention(value: &Value) -> Option<Intention> {
    value
        .get("type")
        .and_then(Value::as_str)
        .map(Intention::from_label)
}

/// Labels the latest turn using a classification model.
pub struct IntentionClassifier {
    model: Arc<dyn CompletionModel>,
    model_name: String,
    system_prompt: String,
    history_window: usize,
}

impl IntentionClassifier {
    pub fn new(
        model: Arc<dyn CompletionModel>,
        model_name: impl Into<String>,
        system_prompt: impl Into<String>,
        history_window: usize,
    ) -> Self {
        Self {
            model,
            model_name: model_name.into(),
            system_prompt: system_prompt.into(),
            history_window,
        }
    }

    /// Classify the chat. Single attempt, no retries.
    pub async fn classify(&self, chat: &Chat) -> Intention {
        let request = CompletionRequest {
            model: self.model_name.clone(),
            system: self.system_prompt.clone(),
            messages: chat.recent(self.history_window).to_vec(),
            temperature: None,
            max_tokens: None,
        };

        match self
            .model
            .complete_structured(&request, &intention_schema())
            .await
        {
            Ok(value) => parse_intention(&value).unwrap_or_else(|| {
                tracing::warn!(output = %value, "intention output missing 'type'; using random_message");
                Intention::RandomMessage
            }),
            Err(e) => {
                tracing::warn!(error = %e, "intention detection failed; using random_message");
                Intention::RandomMessage
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use crate::providers::ProviderError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted {
        reply: Result<Value, ProviderError>,
        seen_messages: Mutex<usize>,
    }

    #[async_trait]
    impl CompletionModel for Scripted {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, ProviderError> {
            unreachable!("classifier only uses structured output")
        }

        async fn complete_structured(
            &self,
            request: &CompletionRequest,
            schema: &OutputSchema,
        ) -> Result<Value, ProviderError> {
            assert_eq!(schema.name, "intention");
            *self.seen_messages.lock().unwrap() = request.messages.len();
            self.reply.clone()
        }
    }

    fn classifier(reply: Result<Value, ProviderError>) -> (IntentionClassifier, Arc<Scripted>) {
        let model = Arc::new(Scripted {
            reply,
            seen_messages: Mutex::new(0),
        });
        (
            IntentionClassifier::new(model.clone(), "gpt-4o-mini", "classify", 7),
            model,
        )
    }

    fn chat(n: usize) -> Chat {
        Chat::new("c", (0..n).map(|i| Message::user(format!("m{}", i))).collect())
    }

    #[tokio::test]
    async fn test_classifies_question() {
        let (c, _) = classifier(Ok(json!({"type": "question"})));
        assert_eq!(c.classify(&chat(1)).await, Intention::Question);
    }

    #[tokio::test]
    async fn test_network_failure_falls_back() {
        let (c, _) = classifier(Err(ProviderError::Transport("connection reset".into())));
        assert_eq!(c.classify(&chat(1)).await, Intention::RandomMessage);
    }

    #[tokio::test]
    async fn test_missing_field_falls_back() {
        let (c, _) = classifier(Ok(json!({"label": "question"})));
        assert_eq!(c.classify(&chat(1)).await, Intention::RandomMessage);
    }

    #[tokio::test]
    async fn test_history_window_is_applied() {
        let (c, model) = classifier(Ok(json!({"type": "hostile_message"})));
        assert_eq!(c.classify(&chat(12)).await, Intention::HostileMessage);
        assert_eq!(*model.seen_messages.lock().unwrap(), 7);
    }

    #[test]
    fn test_label_roundtrip() {
        for i in Intention::KNOWN {
            assert_eq!(Intention::from_label(i.as_str()), i);
        }
        assert_eq!(Intention::from_label("smalltalk"), Intention::Unknown);
    }
}
