//! Anthropic Messages API client.
//!
//! Anthropic streams named SSE events. A producer task reads the response
//! body and forwards `text`, `error` and `end` as [`ProviderEvent`]s onto a
//! bounded channel; the adapter consumes the receiver. Dropping the receiver
//! stops the producer and closes the response.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

use super::sse::{SseDecoder, SseEvent};
use super::{
    http_error, CompletionRequest, ProviderError, ProviderEvent, StreamingProvider, UpstreamStream,
};
use crate::models::Role;

/// Anthropic rejects requests without an output ceiling.
const DEFAULT_MAX_TOKENS: u32 = 4096;

const EVENT_BUFFER: usize = 32;

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    version: String,
}

impl AnthropicClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        version: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            version: version.into(),
        })
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        // Anthropic only knows user and assistant turns.
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    _ => "assistant",
                };
                json!({"role": role, "content": m.content})
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "system": request.system,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": true,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        body
    }
}

/// Map one SSE event onto the provider event vocabulary.
///
/// `None` for bookkeeping events (`ping`, `message_start`, block start/stop,
/// non-text deltas).
fn translate(event: &SseEvent) -> Option<ProviderEvent> {
    let name = event.event.as_deref()?;
    match name {
        "content_block_delta" => {
            let json: Value = serde_json::from_str(&event.data).ok()?;
            let delta = json.get("delta")?;
            if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
                return None;
            }
            let text = delta.get("text").and_then(Value::as_str).unwrap_or_default();
            Some(ProviderEvent::Text(text.to_string()))
        }
        "message_stop" => Some(ProviderEvent::End),
        "error" => {
            let message = serde_json::from_str::<Value>(&event.data)
                .ok()
                .and_then(|j| {
                    j.pointer("/error/message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "Anthropic stream error".to_string());
            Some(ProviderEvent::Error(message))
        }
        _ => None,
    }
}

/// Read the response body and push events until a terminal one is sent.
///
/// Returns without sending anything terminal if the body ends early or the
/// connection drops; the consumer sees the channel close. Dropping the
/// receiver drops the response.
async fn produce(response: reqwest::Response, tx: mpsc::Sender<ProviderEvent>) {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    loop {
        let chunk = tokio::select! {
            chunk = body.next() => chunk,
            _ = tx.closed() => return,
        };
        let Some(chunk) = chunk else { break };
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "anthropic stream body failed");
                return;
            }
        };
        for event in decoder.push(&bytes) {
            let Some(ev) = translate(&event) else {
                continue;
            };
            let terminal = matches!(ev, ProviderEvent::End | ProviderEvent::Error(_));
            if tx.send(ev).await.is_err() || terminal {
                return;
            }
        }
    }

    if let Some(ev) = decoder.finish().as_ref().and_then(translate) {
        let _ = tx.send(ev).await;
    }
}

#[async_trait]
impl StreamingProvider for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream_chat(
        &self,
        request: &CompletionRequest,
    ) -> Result<UpstreamStream, ProviderError> {
        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.version)
            .json(&self.request_body(request))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(http_error("anthropic", response).await);
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(produce(response, tx));
        Ok(UpstreamStream::Events(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    fn sse(event: &str, data: &str) -> SseEvent {
        SseEvent {
            event: Some(event.to_string()),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_translate_text_delta() {
        let ev = sse(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
        );
        assert_eq!(translate(&ev), Some(ProviderEvent::Text("Hel".into())));
    }

    #[test]
    fn test_translate_terminal_events() {
        assert_eq!(
            translate(&sse("message_stop", r#"{"type":"message_stop"}"#)),
            Some(ProviderEvent::End)
        );
        let err = sse(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert_eq!(translate(&err), Some(ProviderEvent::Error("Overloaded".into())));
    }

    #[test]
    fn test_translate_ignores_bookkeeping() {
        assert_eq!(translate(&sse("ping", "{}")), None);
        assert_eq!(translate(&sse("message_start", "{}")), None);
        let json_delta = sse(
            "content_block_delta",
            r#"{"delta":{"type":"input_json_delta","partial_json":"{"}}"#,
        );
        assert_eq!(translate(&json_delta), None);
    }

    #[test]
    fn test_request_body_maps_roles() {
        let client = AnthropicClient::new(
            "https://api.anthropic.com/v1",
            "key",
            "2023-06-01",
            Duration::from_secs(5),
        )
        .unwrap();
        let req = CompletionRequest {
            model: "claude-3-5-sonnet-latest".into(),
            system: "sys".into(),
            messages: vec![
                Message::user("q"),
                Message::new(Role::System, "note"),
                Message::assistant("a"),
            ],
            temperature: Some(0.2),
            max_tokens: None,
        };
        let body = client.request_body(&req);
        assert_eq!(body["system"], "sys");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][1]["role"], "assistant");
        assert_eq!(body["messages"][2]["role"], "assistant");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["stream"], true);
    }
}
