//! Streaming transport: wire events and the single-writer output sink.
//!
//! Each request owns one bounded channel. The orchestrator holds the
//! [`EventSink`] (the only writer); the HTTP body or CLI holds the receiver.
//! Every event is serialized as one newline-terminated JSON record.
//!
//! # Wire format
//!
//! ```json
//! {"type":"loading","indicator":{"status":"Reading through documents","icon":"searching"}}
//! {"type":"message","message":{"role":"assistant","content":"A balk is","citations":[...]}}
//! {"type":"done","final_message":"A balk is an illegal motion..."}
//! {"type":"error","indicator":{"status":"Unsupported provider: cohere","icon":"error"}}
//! ```
//!
//! # Termination
//!
//! A stream ends with exactly one of: a `done` event, a terminal `error`
//! event, or a bare close. Both terminal writes consume the sink, so nothing
//! can be written after them. Advisory errors ([`EventSink::warn`]) do not
//! end the stream.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::{Citation, Role};

/// Events buffered per request before the writer waits on the reader.
pub const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorIcon {
    Thinking,
    Searching,
    Documents,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    pub status: String,
    pub icon: IndicatorIcon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamedMessage {
    pub role: Role,
    /// The whole answer so far, not a delta.
    pub content: String,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Loading { indicator: Indicator },
    Message { message: StreamedMessage },
    Done { final_message: String },
    Error { indicator: Indicator },
}

impl StreamEvent {
    pub fn loading(status: impl Into<String>, icon: IndicatorIcon) -> Self {
        StreamEvent::Loading {
            indicator: Indicator {
                status: status.into(),
                icon,
            },
        }
    }

    pub fn message(content: impl Into<String>, citations: Vec<Citation>) -> Self {
        StreamEvent::Message {
            message: StreamedMessage {
                role: Role::Assistant,
                content: content.into(),
                citations,
            },
        }
    }

    pub fn done(final_message: impl Into<String>) -> Self {
        StreamEvent::Done {
            final_message: final_message.into(),
        }
    }

    pub fn error(status: impl Into<String>) -> Self {
        StreamEvent::Error {
            indicator: Indicator {
                status: status.into(),
                icon: IndicatorIcon::Error,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Loading { .. } => "loading",
            StreamEvent::Message { .. } => "message",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// Serialize one event as a newline-terminated JSON record.
pub fn encode_record(event: &StreamEvent) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    Ok(line)
}

/// Parse newline-delimited records back into events. Blank lines are skipped.
pub fn decode_records(text: &str) -> serde_json::Result<Vec<StreamEvent>> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}

/// The reader went away; stop producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event stream reader disconnected")]
pub struct SinkClosed;

/// Create a per-request sink and its reader.
pub fn channel(capacity: usize) -> (EventSink, mpsc::Receiver<StreamEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSink { tx }, rx)
}

/// Single-writer, ordered, backpressured event sink.
///
/// Dropping the sink closes the stream.
#[derive(Debug)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    async fn push(&mut self, event: StreamEvent) -> Result<(), SinkClosed> {
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }

    /// Transient status shown while work is in progress.
    pub async fn indicator(
        &mut self,
        status: impl Into<String>,
        icon: IndicatorIcon,
    ) -> Result<(), SinkClosed> {
        self.push(StreamEvent::loading(status, icon)).await
    }

    /// The cumulative answer so far.
    pub async fn message(
        &mut self,
        content: impl Into<String>,
        citations: &[Citation],
    ) -> Result<(), SinkClosed> {
        self.push(StreamEvent::message(content, citations.to_vec()))
            .await
    }

    /// An `error` event that does not end the stream.
    pub async fn warn(&mut self, status: impl Into<String>) -> Result<(), SinkClosed> {
        self.push(StreamEvent::error(status)).await
    }

    /// Emit `done` and close.
    pub async fn done(mut self, final_message: impl Into<String>) -> Result<(), SinkClosed> {
        self.push(StreamEvent::done(final_message)).await
    }

    /// Emit a terminal `error` and close.
    pub async fn fail(mut self, status: impl Into<String>) -> Result<(), SinkClosed> {
        self.push(StreamEvent::error(status)).await
    }

    /// Resolves once the reader has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// A handle that may only write a terminal error after this sink is gone.
    ///
    /// Used at the request boundary to report a timeout once the writer's
    /// future has been dropped.
    pub fn reserve(&self) -> ReservedFailure {
        ReservedFailure {
            tx: self.tx.clone(),
        }
    }
}

/// See [`EventSink::reserve`].
#[derive(Debug)]
pub struct ReservedFailure {
    tx: mpsc::Sender<StreamEvent>,
}

impl ReservedFailure {
    pub async fn fail(self, status: impl Into<String>) -> Result<(), SinkClosed> {
        self.tx
            .send(StreamEvent::error(status))
            .await
            .map_err(|_| SinkClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shapes() {
        let loading = encode_record(&StreamEvent::loading("Reading", IndicatorIcon::Searching))
            .unwrap();
        assert_eq!(
            loading,
            "{\"type\":\"loading\",\"indicator\":{\"status\":\"Reading\",\"icon\":\"searching\"}}\n"
        );

        let done = encode_record(&StreamEvent::done("Hi there")).unwrap();
        assert_eq!(done, "{\"type\":\"done\",\"final_message\":\"Hi there\"}\n");

        let err = encode_record(&StreamEvent::error("boom")).unwrap();
        assert!(err.contains("\"icon\":\"error\""));

        let msg = encode_record(&StreamEvent::message("Hi", vec![])).unwrap();
        assert!(msg.contains("\"role\":\"assistant\""));
        assert!(msg.contains("\"citations\":[]"));
    }

    #[test]
    fn test_decode_records() {
        let text = format!(
            "{}{}\n",
            encode_record(&StreamEvent::message("Hi", vec![])).unwrap(),
            encode_record(&StreamEvent::done("Hi")).unwrap()
        );
        let events = decode_records(&text).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], StreamEvent::done("Hi"));
    }

    #[tokio::test]
    async fn test_sink_preserves_order_and_closes_after_done() {
        let (mut sink, mut rx) = channel(8);
        sink.indicator("thinking", IndicatorIcon::Thinking)
            .await
            .unwrap();
        sink.message("a", &[]).await.unwrap();
        sink.done("a").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().kind(), "loading");
        assert_eq!(rx.recv().await.unwrap().kind(), "message");
        assert_eq!(rx.recv().await.unwrap().kind(), "done");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_reader_drop_reports_closed() {
        let (mut sink, rx) = channel(8);
        drop(rx);
        tokio::time::timeout(std::time::Duration::from_secs(1), sink.closed())
            .await
            .unwrap();
        assert_eq!(sink.warn("x").await, Err(SinkClosed));
    }

    #[tokio::test]
    async fn test_reserved_failure_after_writer_dropped() {
        let (sink, mut rx) = channel(8);
        let reserve = sink.reserve();
        drop(sink);
        reserve.fail("timed out").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), StreamEvent::error("timed out"));
        assert!(rx.recv().await.is_none());
    }
}
