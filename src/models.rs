//! Core data models used throughout Answer Relay.
//!
//! These types represent the chat turns, retrieved chunks, aggregated
//! sources and citations that flow through routing, retrieval and streaming.

use serde::{Deserialize, Serialize};

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// A single chat message.
///
/// Citations are only meaningful for the assistant turn that produced them
/// and are stripped before a message is reused as model history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            citations: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A conversation as posted by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Chat {
    pub fn new(id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: id.into(),
            messages,
            metadata: None,
        }
    }

    /// The last `window` messages, oldest first.
    pub fn recent(&self, window: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(window);
        &self.messages[start..]
    }

    /// The most recent user message, if any.
    pub fn latest_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }
}

/// Clone `messages` with their citation lists removed.
pub fn strip_citations(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|m| Message::new(m.role, m.content.clone()))
        .collect()
}

/// A unit returned by the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Index-side identifier of the chunk.
    pub id: String,
    /// The text span.
    pub text: String,
    /// Originating document; chunks are grouped into sources by this value.
    pub source_url: String,
    /// Human-readable description of the originating document.
    #[serde(default)]
    pub source_description: String,
    /// Position of the chunk within its document.
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub pre_context: String,
    #[serde(default)]
    pub post_context: String,
    /// Relevance score from the similarity search (higher is better).
    #[serde(default)]
    pub score: f64,
}

/// One or more chunks aggregated per originating document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub source_url: String,
    pub source_description: String,
    /// Best (highest) score among the grouped chunks.
    pub score: f64,
    /// Chunks ordered by their position in the document.
    pub chunks: Vec<Chunk>,
}

/// A numbered reference from an answer to a [`Source`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// 1-based, dense, stable for the lifetime of one response.
    pub ordinal: usize,
    pub source_url: String,
    pub source_description: String,
}
