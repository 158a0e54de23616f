//! LLM provider abstraction.
//!
//! Two traits sit at the network seam:
//! - [`CompletionModel`]: one-shot completions, plain or schema-constrained.
//!   Used for intention classification and hypothetical-answer generation.
//! - [`StreamingProvider`]: streaming chat completions. A provider answers in
//!   one of two shapes, see [`UpstreamStream`].
//!
//! Concrete clients:
//! - **[`openai::OpenAiClient`]**: OpenAI-compatible chat completions
//!   (`openai`, `fireworks`). Streams token deltas.
//! - **[`anthropic::AnthropicClient`]**: Anthropic Messages API. Streams
//!   named events.
//!
//! # Provider Selection
//!
//! Streaming providers are looked up by name in a [`ProviderRegistry`].
//! Lookup is synchronous and happens before any request is built, so an
//! unknown name never reaches the network.

pub mod anthropic;
pub mod openai;
pub mod sse;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::models::Message;

/// Provider names this crate has a client for.
pub const KNOWN_PROVIDERS: [&str; 3] = ["openai", "fireworks", "anthropic"];

const BUSY_MESSAGE: &str = "Service is currently busy. Please try again shortly.";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("Unsupported provider: {0}")]
    Unsupported(String),

    #[error("Provider '{0}' is not configured")]
    NotConfigured(String),

    #[error("{provider} API error {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    /// An error the provider reported inside an otherwise healthy stream.
    #[error("{0}")]
    Upstream(String),

    #[error("Malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// The text shown to the client for this error.
    ///
    /// Response bodies, auth failures and transport details stay in the logs.
    pub fn user_message(&self, fallback: &str) -> String {
        match self {
            ProviderError::Unsupported(_) | ProviderError::NotConfigured(_) => self.to_string(),
            ProviderError::Http { status: 429, .. } => BUSY_MESSAGE.to_string(),
            ProviderError::Upstream(msg) if !msg.trim().is_empty() => msg.clone(),
            _ => fallback.to_string(),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Transport(e.to_string())
    }
}

/// Turn a non-success HTTP response into [`ProviderError::Http`].
pub(crate) async fn http_error(provider: &str, response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ProviderError::Http {
        provider: provider.to_string(),
        status,
        body,
    }
}

/// Inputs for a completion or streaming chat call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    /// Conversation history, oldest first, citations already stripped.
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    /// Output ceiling. Exceeding it is the provider's concern.
    pub max_tokens: Option<u32>,
}

/// A named JSON schema for structured output.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    pub name: String,
    pub schema: Value,
}

#[async_trait]
pub trait CompletionModel: Send + Sync {
    /// Plain text completion.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError>;

    /// Completion constrained to `schema`, parsed as JSON.
    async fn complete_structured(
        &self,
        request: &CompletionRequest,
        schema: &OutputSchema,
    ) -> Result<Value, ProviderError>;
}

/// Named events from a push-style provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Text(String),
    Error(String),
    End,
}

/// The two upstream streaming shapes.
pub enum UpstreamStream {
    /// Pull sequence of text fragments. Exhaustion means completion.
    Deltas(BoxStream<'static, Result<String, ProviderError>>),
    /// Push-style named events bridged onto a channel by a producer task.
    /// Completion is signalled by [`ProviderEvent::End`]; the channel closing
    /// without it means the producer died.
    Events(mpsc::Receiver<ProviderEvent>),
}

impl std::fmt::Debug for UpstreamStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamStream::Deltas(_) => f.write_str("UpstreamStream::Deltas"),
            UpstreamStream::Events(_) => f.write_str("UpstreamStream::Events"),
        }
    }
}

#[async_trait]
pub trait StreamingProvider: Send + Sync {
    /// Registry name, e.g. `"openai"`.
    fn name(&self) -> &str;

    /// Open a streaming chat completion.
    ///
    /// Errors returned here are setup failures (bad status, refused
    /// connection); failures after the stream is open arrive in-band.
    async fn stream_chat(&self, request: &CompletionRequest)
        -> Result<UpstreamStream, ProviderError>;
}

/// Streaming providers by name.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn StreamingProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn StreamingProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Look up a provider without touching the network.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn StreamingProvider>, ProviderError> {
        if let Some(p) = self.providers.get(name) {
            return Ok(p.clone());
        }
        if KNOWN_PROVIDERS.contains(&name) {
            Err(ProviderError::NotConfigured(name.to_string()))
        } else {
            Err(ProviderError::Unsupported(name.to_string()))
        }
    }

    /// Registered provider names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
