//! Provider stream adapter.
//!
//! Drives one upstream stream to completion and translates it into sink
//! writes. Both upstream shapes end the same way on the wire:
//!
//! | Upstream                         | Sink                     |
//! |----------------------------------|--------------------------|
//! | fragment / `Text`                | `message` (full buffer)  |
//! | delta sequence exhausted / `End` | `done`                   |
//! | delta `Err` / `Error`            | terminal `error`         |
//! | event channel closed, no `End`   | terminal `error`         |
//!
//! Nothing is retried once streaming has begun. If the reader goes away
//! while the upstream is stalled, the upstream is dropped without waiting
//! for its next item.

use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::models::{Citation, Message};
use crate::providers::{
    CompletionRequest, ProviderError, ProviderEvent, ProviderRegistry, UpstreamStream,
};
use crate::stream::{EventSink, SinkClosed};

/// How a streamed answer ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerOutcome {
    /// `done` was emitted with this text.
    Completed(String),
    /// A terminal error was emitted after `partial` had been streamed.
    Failed { partial: String, reason: String },
    /// The provider was rejected before any request was sent.
    Rejected(String),
}

impl AnswerOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            AnswerOutcome::Completed(_) => "completed",
            AnswerOutcome::Failed { .. } => "failed",
            AnswerOutcome::Rejected(_) => "rejected",
        }
    }
}

/// Everything needed to stream one answer.
#[derive(Debug, Clone)]
pub struct AnswerRequest<'a> {
    pub provider: &'a str,
    pub model: &'a str,
    pub temperature: f32,
    pub system_prompt: String,
    pub history: Vec<Message>,
    pub citations: &'a [Citation],
}

pub struct StreamAdapter {
    registry: ProviderRegistry,
    max_tokens: u32,
    fallback_message: String,
    log_streams: bool,
}

impl StreamAdapter {
    pub fn new(
        registry: ProviderRegistry,
        max_tokens: u32,
        fallback_message: impl Into<String>,
        log_streams: bool,
    ) -> Self {
        Self {
            registry,
            max_tokens,
            fallback_message: fallback_message.into(),
            log_streams,
        }
    }

    /// Stream an answer into `sink`, ending it with `done` or a terminal error.
    ///
    /// `Err(SinkClosed)` means the reader left; the upstream is dropped.
    pub async fn stream_answer(
        &self,
        request: AnswerRequest<'_>,
        sink: EventSink,
    ) -> Result<AnswerOutcome, SinkClosed> {
        let provider = match self.registry.resolve(request.provider) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(provider = request.provider, error = %e, "provider rejected");
                let message = e.user_message(&self.fallback_message);
                sink.fail(message.clone()).await?;
                return Ok(AnswerOutcome::Rejected(message));
            }
        };

        let completion = CompletionRequest {
            model: request.model.to_string(),
            system: request.system_prompt,
            messages: request.history,
            temperature: Some(request.temperature),
            max_tokens: Some(self.max_tokens),
        };

        let started = Instant::now();
        if self.log_streams {
            tracing::info!(
                provider = request.provider,
                model = request.model,
                temperature = request.temperature,
                history = completion.messages.len(),
                citations = request.citations.len(),
                "streaming answer"
            );
        }

        let upstream = match provider.stream_chat(&completion).await {
            Ok(u) => u,
            Err(e) => {
                tracing::error!(provider = request.provider, error = %e, "failed to open stream");
                let reason = e.user_message(&self.fallback_message);
                sink.fail(reason.clone()).await?;
                return Ok(AnswerOutcome::Failed {
                    partial: String::new(),
                    reason,
                });
            }
        };

        let outcome = match upstream {
            UpstreamStream::Deltas(deltas) => {
                self.relay_deltas(deltas, sink, request.citations).await?
            }
            UpstreamStream::Events(events) => {
                self.relay_events(events, sink, request.citations).await?
            }
        };

        if self.log_streams {
            let elapsed = started.elapsed().as_secs_f64();
            match &outcome {
                AnswerOutcome::Completed(text) => {
                    tracing::info!(elapsed_secs = elapsed, chars = text.len(), "answer complete")
                }
                AnswerOutcome::Failed { partial, reason } => tracing::warn!(
                    elapsed_secs = elapsed,
                    chars = partial.len(),
                    reason = %reason,
                    "answer failed mid-stream"
                ),
                AnswerOutcome::Rejected(_) => {}
            }
        }
        Ok(outcome)
    }

    async fn relay_deltas(
        &self,
        mut deltas: BoxStream<'static, Result<String, ProviderError>>,
        mut sink: EventSink,
        citations: &[Citation],
    ) -> Result<AnswerOutcome, SinkClosed> {
        let mut buffer = String::new();
        loop {
            let item = tokio::select! {
                item = deltas.next() => item,
                _ = sink.closed() => return Err(SinkClosed),
            };
            let Some(item) = item else { break };
            match item {
                Ok(fragment) => {
                    buffer.push_str(&fragment);
                    sink.message(buffer.as_str(), citations).await?;
                }
                Err(e) => {
                    tracing::error!(error = %e, "upstream delta stream failed");
                    let reason = e.user_message(&self.fallback_message);
                    sink.fail(reason.clone()).await?;
                    return Ok(AnswerOutcome::Failed {
                        partial: buffer,
                        reason,
                    });
                }
            }
        }
        sink.done(buffer.as_str()).await?;
        Ok(AnswerOutcome::Completed(buffer))
    }

    async fn relay_events(
        &self,
        mut events: mpsc::Receiver<ProviderEvent>,
        mut sink: EventSink,
        citations: &[Citation],
    ) -> Result<AnswerOutcome, SinkClosed> {
        let mut buffer = String::new();
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = sink.closed() => return Err(SinkClosed),
            };
            let Some(event) = event else { break };
            match event {
                ProviderEvent::Text(fragment) => {
                    buffer.push_str(&fragment);
                    sink.message(buffer.as_str(), citations).await?;
                }
                ProviderEvent::Error(message) => {
                    tracing::error!(error = %message, "upstream reported an error");
                    let reason = if message.trim().is_empty() {
                        self.fallback_message.clone()
                    } else {
                        message
                    };
                    sink.fail(reason.clone()).await?;
                    return Ok(AnswerOutcome::Failed {
                        partial: buffer,
                        reason,
                    });
                }
                ProviderEvent::End => {
                    sink.done(buffer.as_str()).await?;
                    return Ok(AnswerOutcome::Completed(buffer));
                }
            }
        }

        tracing::error!("upstream event channel closed before end");
        sink.fail(self.fallback_message.as_str()).await?;
        Ok(AnswerOutcome::Failed {
            partial: buffer,
            reason: self.fallback_message.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::StreamingProvider;
    use crate::stream::{channel, StreamEvent};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    enum Script {
        Deltas(Vec<Result<String, ProviderError>>),
        /// Yields the items, then never yields again.
        Stalled(Vec<Result<String, ProviderError>>),
        Events(Vec<ProviderEvent>),
        Refuse(ProviderError),
    }

    struct Fake {
        name: &'static str,
        script: Mutex<Option<Script>>,
        calls: AtomicUsize,
    }

    impl Fake {
        fn new(name: &'static str, script: Script) -> Arc<Self> {
            Arc::new(Self {
                name,
                script: Mutex::new(Some(script)),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl StreamingProvider for Fake {
        fn name(&self) -> &str {
            self.name
        }

        async fn stream_chat(
            &self,
            _request: &CompletionRequest,
        ) -> Result<UpstreamStream, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let script = self.script.lock().unwrap().take().unwrap();
            match script {
                Script::Deltas(items) => {
                    Ok(UpstreamStream::Deltas(futures::stream::iter(items).boxed()))
                }
                Script::Stalled(items) => Ok(UpstreamStream::Deltas(
                    futures::stream::iter(items)
                        .chain(futures::stream::pending())
                        .boxed(),
                )),
                Script::Events(items) => {
                    let (tx, rx) = mpsc::channel(16);
                    for ev in items {
                        tx.send(ev).await.unwrap();
                    }
                    Ok(UpstreamStream::Events(rx))
                }
                Script::Refuse(e) => Err(e),
            }
        }
    }

    fn adapter(provider: Arc<Fake>) -> StreamAdapter {
        let mut registry = ProviderRegistry::new();
        registry.register(provider);
        StreamAdapter::new(registry, 4096, "Sorry", false)
    }

    fn request<'a>(provider: &'a str, citations: &'a [Citation]) -> AnswerRequest<'a> {
        AnswerRequest {
            provider,
            model: "m",
            temperature: 0.5,
            system_prompt: "sys".into(),
            history: vec![Message::user("hi")],
            citations,
        }
    }

    async fn run(
        adapter: &StreamAdapter,
        req: AnswerRequest<'_>,
    ) -> (AnswerOutcome, Vec<StreamEvent>) {
        let (sink, mut rx) = channel(64);
        let outcome = adapter.stream_answer(req, sink).await.unwrap();
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        (outcome, events)
    }

    #[tokio::test]
    async fn test_deltas_accumulate_then_done() {
        let fake = Fake::new(
            "openai",
            Script::Deltas(vec![Ok("Hi".into()), Ok(" there".into())]),
        );
        let (outcome, events) = run(&adapter(fake), request("openai", &[])).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::message("Hi", vec![]),
                StreamEvent::message("Hi there", vec![]),
                StreamEvent::done("Hi there"),
            ]
        );
        assert_eq!(outcome, AnswerOutcome::Completed("Hi there".into()));
    }

    #[tokio::test]
    async fn test_empty_fragment_still_emits_message() {
        let fake = Fake::new("openai", Script::Deltas(vec![Ok(String::new()), Ok("a".into())]));
        let (_, events) = run(&adapter(fake), request("openai", &[])).await;
        assert_eq!(events[0], StreamEvent::message("", vec![]));
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_delta_error_is_terminal() {
        let fake = Fake::new(
            "openai",
            Script::Deltas(vec![
                Ok("Hi".into()),
                Err(ProviderError::Transport("reset".into())),
                Ok("never".into()),
            ]),
        );
        let (outcome, events) = run(&adapter(fake), request("openai", &[])).await;
        assert_eq!(
            events,
            vec![StreamEvent::message("Hi", vec![]), StreamEvent::error("Sorry")]
        );
        assert!(matches!(outcome, AnswerOutcome::Failed { partial, .. } if partial == "Hi"));
    }

    #[tokio::test]
    async fn test_events_end_in_done_and_ignore_after_end() {
        let fake = Fake::new(
            "anthropic",
            Script::Events(vec![
                ProviderEvent::Text("A".into()),
                ProviderEvent::Text("B".into()),
                ProviderEvent::End,
                ProviderEvent::Text("C".into()),
            ]),
        );
        let citations = vec![Citation {
            ordinal: 1,
            source_url: "https://x".into(),
            source_description: "X".into(),
        }];
        let (outcome, events) = run(&adapter(fake), request("anthropic", &citations)).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[1], StreamEvent::message("AB", citations.clone()));
        assert_eq!(events[2], StreamEvent::done("AB"));
        assert_eq!(outcome, AnswerOutcome::Completed("AB".into()));
    }

    #[tokio::test]
    async fn test_event_error_closes_and_later_end_is_ignored() {
        let fake = Fake::new(
            "anthropic",
            Script::Events(vec![
                ProviderEvent::Text("A".into()),
                ProviderEvent::Error("Overloaded".into()),
                ProviderEvent::End,
            ]),
        );
        let (_, events) = run(&adapter(fake), request("anthropic", &[])).await;
        assert_eq!(
            events,
            vec![StreamEvent::message("A", vec![]), StreamEvent::error("Overloaded")]
        );
    }

    #[tokio::test]
    async fn test_event_channel_closed_without_end_fails() {
        let fake = Fake::new("anthropic", Script::Events(vec![ProviderEvent::Text("A".into())]));
        let (outcome, events) = run(&adapter(fake), request("anthropic", &[])).await;
        assert_eq!(events.last(), Some(&StreamEvent::error("Sorry")));
        assert!(matches!(outcome, AnswerOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_unsupported_provider_never_calls_upstream() {
        let fake = Fake::new("openai", Script::Deltas(vec![]));
        let adapter = adapter(fake.clone());
        let (outcome, events) = run(&adapter, request("cohere", &[])).await;
        assert_eq!(events, vec![StreamEvent::error("Unsupported provider: cohere")]);
        assert!(matches!(outcome, AnswerOutcome::Rejected(_)));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_open_failure_hides_auth_details() {
        let fake = Fake::new(
            "openai",
            Script::Refuse(ProviderError::Http {
                provider: "openai".into(),
                status: 401,
                body: "bad key".into(),
            }),
        );
        let (_, events) = run(&adapter(fake), request("openai", &[])).await;
        assert_eq!(events, vec![StreamEvent::error("Sorry")]);
    }

    #[tokio::test]
    async fn test_reader_gone_stops_relay() {
        let fake = Fake::new(
            "openai",
            Script::Deltas(vec![Ok("a".into()), Ok("b".into())]),
        );
        let adapter = adapter(fake);
        let (sink, rx) = channel(1);
        drop(rx);
        let result = adapter.stream_answer(request("openai", &[]), sink).await;
        assert_eq!(result, Err(SinkClosed));
    }

    #[tokio::test]
    async fn test_reader_gone_during_stall_stops_relay() {
        let fake = Fake::new("openai", Script::Stalled(vec![Ok("a".into())]));
        let adapter = adapter(fake);
        let (sink, mut rx) = channel(8);

        let task = tokio::spawn(async move {
            adapter.stream_answer(request("openai", &[]), sink).await
        });
        assert_eq!(rx.recv().await, Some(StreamEvent::message("a", vec![])));
        drop(rx);

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("relay kept waiting on a stalled upstream")
            .unwrap();
        assert_eq!(result, Err(SinkClosed));
    }
}
