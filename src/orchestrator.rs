//! Per-turn response orchestration.
//!
//! A [`Responder`] runs one chat turn from classification to the terminal
//! stream event:
//!
//! ```text
//! classify ─▶ resolve strategy ─┬─ question ─▶ thinking ─▶ retrieve ─▶ searching
//!                               │                 ─▶ documents:N ─▶ thinking ─▶ stream
//!                               │      (retrieval failed) ─▶ advisory error ─▶ backup stream
//!                               └─ other ─▶ thinking ─▶ stream
//! ```
//!
//! Every path hands the sink to the [`StreamAdapter`], which is the only
//! code that writes `done` or a terminal `error`.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::adapter::{AnswerOutcome, AnswerRequest, StreamAdapter};
use crate::intention::{Intention, IntentionClassifier};
use crate::models::{strip_citations, Chat, Message};
use crate::prompts::PromptsConfig;
use crate::retrieval::{Grounding, RetrievalError, RetrievalPipeline};
use crate::strategy::{StrategyConfig, StrategyTable};
use crate::stream::{self, EventSink, IndicatorIcon, SinkClosed, StreamEvent, CHANNEL_CAPACITY};

pub const STATUS_PLANNING: &str = "Figuring out what your answer looks like";
pub const STATUS_SEARCHING: &str = "Reading through documents";
pub const STATUS_ANSWERING: &str = "Coming up with an answer";
pub const STATUS_TIMED_OUT: &str = "This is taking too long. Please try again.";

pub fn documents_status(count: usize) -> String {
    if count == 1 {
        "Read over 1 document".to_string()
    } else {
        format!("Read over {} documents", count)
    }
}

/// Summary of a finished turn, for logging and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub intention: Intention,
    /// Number of distinct sources cited (0 outside the question path).
    pub sources: usize,
    pub retrieval_failed: bool,
    pub outcome: AnswerOutcome,
}

pub struct Responder {
    classifier: IntentionClassifier,
    strategies: StrategyTable,
    retrieval: RetrievalPipeline,
    adapter: StreamAdapter,
    prompts: PromptsConfig,
    history_window: usize,
}

impl Responder {
    pub fn new(
        classifier: IntentionClassifier,
        strategies: StrategyTable,
        retrieval: RetrievalPipeline,
        adapter: StreamAdapter,
        prompts: PromptsConfig,
        history_window: usize,
    ) -> Self {
        Self {
            classifier,
            strategies,
            retrieval,
            adapter,
            prompts,
            history_window,
        }
    }

    /// Classify the chat and answer it.
    pub async fn respond(&self, chat: &Chat, sink: EventSink) -> Result<TurnReport, SinkClosed> {
        let intention = self.classifier.classify(chat).await;
        tracing::info!(intention = %intention, "turn classified");
        self.respond_as(intention, chat, sink).await
    }

    /// Answer the chat as if it had been classified as `intention`.
    pub async fn respond_as(
        &self,
        intention: Intention,
        chat: &Chat,
        sink: EventSink,
    ) -> Result<TurnReport, SinkClosed> {
        let strategy = self.strategies.resolve(intention);
        match intention {
            Intention::Question => self.answer_question(chat, strategy, sink).await,
            Intention::HostileMessage => {
                let prompt = self.prompts.hostile_message_prompt();
                self.answer_plain(intention, prompt, chat, strategy, sink)
                    .await
            }
            Intention::RandomMessage | Intention::Unknown => {
                let prompt = self.prompts.random_message_prompt();
                self.answer_plain(intention, prompt, chat, strategy, sink)
                    .await
            }
        }
    }

    async fn answer_plain(
        &self,
        intention: Intention,
        system_prompt: String,
        chat: &Chat,
        strategy: &StrategyConfig,
        mut sink: EventSink,
    ) -> Result<TurnReport, SinkClosed> {
        sink.indicator(STATUS_ANSWERING, IndicatorIcon::Thinking)
            .await?;
        let request = AnswerRequest {
            provider: &strategy.provider,
            model: &strategy.model,
            temperature: strategy.temperature,
            system_prompt,
            history: self.history(chat, strategy),
            citations: &[],
        };
        let outcome = self.adapter.stream_answer(request, sink).await?;
        Ok(TurnReport {
            intention,
            sources: 0,
            retrieval_failed: false,
            outcome,
        })
    }

    async fn answer_question(
        &self,
        chat: &Chat,
        strategy: &StrategyConfig,
        mut sink: EventSink,
    ) -> Result<TurnReport, SinkClosed> {
        sink.indicator(STATUS_PLANNING, IndicatorIcon::Thinking)
            .await?;

        let (system_prompt, grounding, retrieval_failed) =
            match self.ground(chat, &mut sink).await? {
                Ok(grounding) => {
                    let prompt = self.prompts.question_prompt(&grounding.context);
                    (prompt, grounding, false)
                }
                Err(e) => {
                    tracing::warn!(error = ?e, "retrieval failed; answering without documents");
                    sink.warn(e.to_string()).await?;
                    let prompt = self.prompts.question_backup_prompt();
                    (prompt, Grounding::default(), true)
                }
            };

        sink.indicator(STATUS_ANSWERING, IndicatorIcon::Thinking)
            .await?;

        let request = AnswerRequest {
            provider: &strategy.provider,
            model: &strategy.model,
            temperature: strategy.temperature,
            system_prompt,
            history: self.history(chat, strategy),
            citations: &grounding.citations,
        };
        let outcome = self.adapter.stream_answer(request, sink).await?;
        Ok(TurnReport {
            intention: Intention::Question,
            sources: grounding.sources.len(),
            retrieval_failed,
            outcome,
        })
    }

    /// Run retrieval, reporting progress between steps.
    async fn ground(
        &self,
        chat: &Chat,
        sink: &mut EventSink,
    ) -> Result<Result<Grounding, RetrievalError>, SinkClosed> {
        let hypothetical = match self.retrieval.hypothetical_answer(chat).await {
            Ok(h) => h,
            Err(e) => return Ok(Err(e)),
        };
        let vector = match self.retrieval.embed(&hypothetical).await {
            Ok(v) => v,
            Err(e) => return Ok(Err(e)),
        };

        sink.indicator(STATUS_SEARCHING, IndicatorIcon::Searching)
            .await?;
        let chunks = match self.retrieval.search(&vector).await {
            Ok(c) => c,
            Err(e) => return Ok(Err(e)),
        };

        let grounding = Grounding::from_chunks(chunks);
        sink.indicator(
            documents_status(grounding.sources.len()),
            IndicatorIcon::Documents,
        )
        .await?;
        Ok(Ok(grounding))
    }

    /// Model history for a strategy: the recent window, or just the latest
    /// user message when the strategy does not use history.
    fn history(&self, chat: &Chat, strategy: &StrategyConfig) -> Vec<Message> {
        if strategy.requires_history {
            strip_citations(chat.recent(self.history_window))
        } else {
            chat.latest_user_message()
                .map(|m| vec![Message::user(m.content.clone())])
                .unwrap_or_default()
        }
    }
}

/// Run one turn on a background task and return the event reader.
///
/// The turn is bounded by `timeout`; when it expires the turn is dropped
/// and a terminal error is written in its place.
pub fn spawn_turn(
    responder: Arc<Responder>,
    chat: Chat,
    timeout: Duration,
    span: tracing::Span,
) -> mpsc::Receiver<StreamEvent> {
    let (sink, rx) = stream::channel(CHANNEL_CAPACITY);
    let reserved = sink.reserve();

    tokio::spawn(
        async move {
            let started = Instant::now();
            match tokio::time::timeout(timeout, responder.respond(&chat, sink)).await {
                Ok(Ok(report)) => tracing::info!(
                    intention = %report.intention,
                    sources = report.sources,
                    retrieval_failed = report.retrieval_failed,
                    outcome = report.outcome.kind(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "turn finished"
                ),
                Ok(Err(SinkClosed)) => tracing::info!("client disconnected; turn abandoned"),
                Err(_) => {
                    tracing::warn!(timeout_secs = timeout.as_secs(), "turn timed out");
                    let _ = reserved.fail(STATUS_TIMED_OUT).await;
                }
            }
        }
        .instrument(span),
    );

    rx
}
