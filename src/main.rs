//! # Answer Relay CLI (`relay`)
//!
//! ## Usage
//!
//! ```bash
//! relay --config ./config/relay.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `relay serve` | Start the streaming HTTP server |
//! | `relay ask "<question>"` | Answer one message and print the stream |
//! | `relay check` | Validate config and required environment variables |
//!
//! ## Examples
//!
//! ```bash
//! export OPENAI_API_KEY=... PINECONE_API_KEY=...
//! relay check
//! relay ask "What is a balk?"
//! relay ask "What is a balk?" --raw     # print NDJSON records
//! relay serve
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use answer_relay::config::{load_config, Config};
use answer_relay::intention::Intention;
use answer_relay::models::{Chat, Message};
use answer_relay::orchestrator::spawn_turn;
use answer_relay::server::run_server;
use answer_relay::services::{build_responder, Secrets, ServiceParts};
use answer_relay::stream::{encode_record, StreamEvent};
use answer_relay::strategy::StrategyTable;

/// Answer Relay: intent-routed, document-grounded chat answers streamed
/// as newline-delimited JSON.
#[derive(Parser)]
#[command(
    name = "relay",
    about = "Answer Relay: intent-routed, document-grounded streaming chat answers",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/relay.toml")]
    config: PathBuf,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Answer a single message and print the result.
    Ask {
        /// The user message.
        question: String,

        /// Chat id reported in logs.
        #[arg(long, default_value = "cli")]
        chat_id: String,

        /// Print raw NDJSON records instead of the rendered answer.
        #[arg(long)]
        raw: bool,
    },

    /// Validate config and check required environment variables.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            run_server(&config).await?;
        }
        Commands::Ask {
            question,
            chat_id,
            raw,
        } => {
            run_ask(&config, &chat_id, &question, raw).await?;
        }
        Commands::Check => {
            run_check(&config)?;
        }
    }

    Ok(())
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("answer_relay={level},relay={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_ask(config: &Config, chat_id: &str, question: &str, raw: bool) -> Result<()> {
    let parts = ServiceParts::connect(config, &Secrets::from_env())?;
    let responder = Arc::new(build_responder(config, parts)?);

    let chat = Chat::new(chat_id, vec![Message::user(question)]);
    let span = tracing::info_span!("ask", chat_id = %chat_id);
    let mut rx = spawn_turn(
        responder,
        chat,
        Duration::from_secs(config.server.request_timeout_secs),
        span,
    );

    let mut stdout = std::io::stdout();
    let mut printed = 0usize;
    let mut failed = None;
    let mut citations = Vec::new();

    while let Some(event) = rx.recv().await {
        // An error followed by `done` was advisory.
        match &event {
            StreamEvent::Error { indicator } => failed = Some(indicator.status.clone()),
            StreamEvent::Done { .. } => failed = None,
            _ => {}
        }

        if raw {
            print!("{}", encode_record(&event)?);
            stdout.flush()?;
            continue;
        }
        match event {
            StreamEvent::Loading { indicator } => eprintln!("… {}", indicator.status),
            StreamEvent::Message { message } => {
                // Content is cumulative; print only the new suffix.
                if let Some(tail) = message.content.get(printed..) {
                    print!("{}", tail);
                    stdout.flush()?;
                }
                printed = message.content.len();
                citations = message.citations;
            }
            StreamEvent::Done { .. } => println!(),
            StreamEvent::Error { indicator } => eprintln!("! {}", indicator.status),
        }
    }

    if !raw && !citations.is_empty() {
        println!();
        for c in &citations {
            println!("[{}] {} ({})", c.ordinal, c.source_description, c.source_url);
        }
    }

    if let Some(status) = failed {
        bail!("answer failed: {}", status);
    }
    Ok(())
}

fn run_check(config: &Config) -> Result<()> {
    println!("Config OK");
    println!("  bind:    {}", config.server.bind);
    println!(
        "  index:   {} (top_k = {})",
        config.index.provider, config.retrieval.top_k
    );

    let table = StrategyTable::from_config(config)?;
    println!("Strategies:");
    for intention in Intention::KNOWN {
        let s = table.resolve(intention);
        println!(
            "  {:<16} {}/{} (temperature {}, history {})",
            intention.as_str(),
            s.provider,
            s.model,
            s.temperature,
            if s.requires_history { "yes" } else { "no" }
        );
    }

    let secrets = Secrets::from_env();
    let missing = secrets.missing(config);
    if !missing.is_empty() {
        bail!(
            "Missing required environment variables: {}",
            missing.join(", ")
        );
    }
    println!("Environment OK");
    Ok(())
}
