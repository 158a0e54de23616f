//! # Answer Relay
//!
//! Intent-routed, document-grounded chat answers streamed as
//! newline-delimited JSON.
//!
//! Each inbound chat turn is classified, routed to a response strategy,
//! optionally grounded with retrieved documents, and answered by a streaming
//! LLM provider. Progress, partial answers and the final answer are written
//! to a per-request event stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────────┐   ┌───────────┐
//! │  Chat    │──▶│ Intention  │──▶│ Orchestrator │──▶│  Adapter  │──▶ NDJSON
//! │ request  │   │ classifier │   │  (strategy)  │   │ (provider)│    stream
//! └──────────┘   └────────────┘   └──────┬───────┘   └───────────┘
//!                                        │ question
//!                                        ▼
//!                         ┌──────────────────────────────┐
//!                         │ Retrieval: HyDE → embed →    │
//!                         │ search → sources → citations │
//!                         └──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! relay check                    # validate config and environment
//! relay ask "What is a balk?"    # one-off answer in the terminal
//! relay serve                    # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Chat, chunk, source and citation types |
//! | [`intention`] | Intention classification |
//! | [`strategy`] | Intention → response configuration table |
//! | [`prompts`] | Prompt templates |
//! | [`retrieval`] | HyDE retrieval, source aggregation, citations, context |
//! | [`embedding`] | Embedding client |
//! | [`index`] | Vector index backends |
//! | [`providers`] | LLM provider clients and registry |
//! | [`adapter`] | Upstream stream → event stream translation |
//! | [`orchestrator`] | Per-turn state machine |
//! | [`stream`] | Wire events and the output sink |
//! | [`services`] | Startup wiring and secrets |
//! | [`server`] | HTTP server |

pub mod adapter;
pub mod config;
pub mod embedding;
pub mod index;
pub mod intention;
pub mod models;
pub mod orchestrator;
pub mod prompts;
pub mod providers;
pub mod retrieval;
pub mod services;
pub mod server;
pub mod strategy;
pub mod stream;
