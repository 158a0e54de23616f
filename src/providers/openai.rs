//! OpenAI-compatible chat completions client.
//!
//! Serves both `openai` and `fireworks`; they differ only in base URL and
//! key. Streaming responses are SSE `data:` lines carrying
//! `choices[0].delta.content`, terminated by `data: [DONE]`.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;

use super::sse::SseDecoder;
use super::{
    http_error, CompletionModel, CompletionRequest, OutputSchema, ProviderError,
    StreamingProvider, UpstreamStream,
};

pub struct OpenAiClient {
    name: String,
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiClient {
    /// `name` is the registry name (`openai` or `fireworks`).
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        // No overall timeout on the client: streams may legitimately run long.
        let http = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            name: name.into(),
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system.is_empty() {
            messages.push(json!({"role": "system", "content": request.system}));
        }
        for m in &request.messages {
            messages.push(json!({"role": m.role.as_str(), "content": m.content}));
        }

        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(n) = request.max_tokens {
            body["max_tokens"] = json!(n);
        }
        body
    }

    async fn post_completion(&self, body: &Value) -> Result<Value, ProviderError> {
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(http_error(&self.name, response).await);
        }
        Ok(response.json().await?)
    }
}

/// Pull `choices[0].message.content` out of a non-streaming response.
fn message_content(json: &Value) -> Result<&str, ProviderError> {
    let message = json
        .pointer("/choices/0/message")
        .ok_or_else(|| ProviderError::Malformed("missing choices[0].message".into()))?;

    if let Some(refusal) = message.get("refusal").and_then(Value::as_str) {
        return Err(ProviderError::Upstream(refusal.to_string()));
    }
    message
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Malformed("missing message content".into()))
}

#[async_trait]
impl CompletionModel for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        let body = self.request_body(request);
        let json = self.post_completion(&body).await?;
        message_content(&json).map(str::to_string)
    }

    async fn complete_structured(
        &self,
        request: &CompletionRequest,
        schema: &OutputSchema,
    ) -> Result<Value, ProviderError> {
        let mut body = self.request_body(request);
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": {
                "name": schema.name,
                "schema": schema.schema,
                "strict": true,
            }
        });
        let json = self.post_completion(&body).await?;
        let content = message_content(&json)?;
        serde_json::from_str(content).map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

/// One decoded streaming chunk.
#[derive(Debug, PartialEq)]
enum DeltaChunk {
    Text(String),
    /// Role preamble or usage trailer with no choices.
    Skip,
    Done,
}

fn parse_delta(data: &str) -> Result<DeltaChunk, ProviderError> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(DeltaChunk::Done);
    }
    let json: Value =
        serde_json::from_str(data).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    if let Some(err) = json.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("upstream error");
        return Err(ProviderError::Upstream(message.to_string()));
    }

    match json.pointer("/choices/0") {
        None => Ok(DeltaChunk::Skip),
        Some(choice) => {
            let text = choice
                .pointer("/delta/content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Ok(DeltaChunk::Text(text.to_string()))
        }
    }
}

struct DeltaState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<String, ProviderError>>,
    finished: bool,
}

impl DeltaState {
    fn absorb(&mut self, data: &str) {
        match parse_delta(data) {
            Ok(DeltaChunk::Text(t)) => self.pending.push_back(Ok(t)),
            Ok(DeltaChunk::Skip) => {}
            Ok(DeltaChunk::Done) => self.finished = true,
            Err(e) => {
                self.pending.push_back(Err(e));
                self.finished = true;
            }
        }
    }
}

/// Turn an SSE response body into a pull stream of text fragments.
///
/// The stream ends after `[DONE]`, after the first error, or when the body
/// ends. Dropping it drops the HTTP response.
fn delta_stream(response: reqwest::Response) -> BoxStream<'static, Result<String, ProviderError>> {
    let state = DeltaState {
        body: response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                if item.is_err() {
                    st.pending.clear();
                }
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    for event in st.decoder.push(&bytes) {
                        if st.finished {
                            break;
                        }
                        st.absorb(&event.data);
                    }
                }
                Some(Err(e)) => {
                    st.finished = true;
                    st.pending.push_back(Err(e.into()));
                }
                None => {
                    if let Some(event) = st.decoder.finish() {
                        st.absorb(&event.data);
                    }
                    st.finished = true;
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl StreamingProvider for OpenAiClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream_chat(
        &self,
        request: &CompletionRequest,
    ) -> Result<UpstreamStream, ProviderError> {
        let mut body = self.request_body(request);
        body["stream"] = json!(true);

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(http_error(&self.name, response).await);
        }
        Ok(UpstreamStream::Deltas(delta_stream(response)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    fn client() -> OpenAiClient {
        OpenAiClient::new("openai", "https://example.test/v1/", "sk", Duration::from_secs(5))
            .unwrap()
    }

    #[test]
    fn test_request_body_shape() {
        let req = CompletionRequest {
            model: "gpt-4o".into(),
            system: "be brief".into(),
            messages: vec![Message::user("hi"), Message::assistant("hello")],
            temperature: Some(0.5),
            max_tokens: Some(4096),
        };
        let body = client().request_body(&req);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["messages"][2]["role"], "assistant");
        assert_eq!(body["max_tokens"], 4096);
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        assert_eq!(client().endpoint(), "https://example.test/v1/chat/completions");
    }

    #[test]
    fn test_parse_delta_variants() {
        let text = r#"{"choices":[{"delta":{"content":"Hi"}}]}"#;
        assert_eq!(parse_delta(text).unwrap(), DeltaChunk::Text("Hi".into()));

        let role_only = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_delta(role_only).unwrap(), DeltaChunk::Text(String::new()));

        let usage = r#"{"choices":[],"usage":{"total_tokens":3}}"#;
        assert_eq!(parse_delta(usage).unwrap(), DeltaChunk::Skip);

        assert_eq!(parse_delta("[DONE]").unwrap(), DeltaChunk::Done);
    }

    #[test]
    fn test_parse_delta_error_payload() {
        let err = parse_delta(r#"{"error":{"message":"context length exceeded"}}"#).unwrap_err();
        assert_eq!(err, ProviderError::Upstream("context length exceeded".into()));
        assert!(matches!(
            parse_delta("not json").unwrap_err(),
            ProviderError::Malformed(_)
        ));
    }

    #[test]
    fn test_message_content_refusal() {
        let json = json!({"choices":[{"message":{"content":null,"refusal":"no"}}]});
        assert_eq!(
            message_content(&json).unwrap_err(),
            ProviderError::Upstream("no".into())
        );
        let ok = json!({"choices":[{"message":{"content":"{\"type\":\"question\"}"}}]});
        assert_eq!(message_content(&ok).unwrap(), "{\"type\":\"question\"}");
    }
}
