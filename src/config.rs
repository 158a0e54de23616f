//! TOML configuration parsing and validation.
//!
//! Every section is optional and falls back to built-in defaults, so a
//! config file only needs to name what differs. Secrets (API keys) are never
//! read from the file; see [`crate::services`].

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::intention::Intention;
use crate::prompts::PromptsConfig;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    /// Keyed by intention label (`question`, `hostile_message`, `random_message`).
    /// Rows in the file replace the built-in row of the same label.
    #[serde(default)]
    pub strategies: BTreeMap<String, StrategyEntry>,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

impl Config {
    /// All-defaults configuration.
    pub fn minimal() -> Self {
        Self {
            strategies: default_strategies(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}
fn default_request_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// Number of most recent messages used as model history.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Output token ceiling passed to streaming providers.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_response_message")]
    pub default_response_message: String,
    /// Emit per-stream log lines (provider, timings, counts).
    #[serde(default = "default_true")]
    pub log_streams: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            max_tokens: default_max_tokens(),
            default_response_message: default_response_message(),
            log_streams: true,
        }
    }
}

fn default_history_window() -> usize {
    7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_response_message() -> String {
    "Sorry, I'm having trouble generating a response. Please try again later.".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    #[serde(default = "default_intention_model")]
    pub intention_model: String,
    #[serde(default = "default_hypothetical_model")]
    pub hypothetical_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            intention_model: default_intention_model(),
            hypothetical_model: default_hypothetical_model(),
            embedding_model: default_embedding_model(),
        }
    }
}

fn default_intention_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_hypothetical_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

/// One row of the strategy table as written in the config file.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StrategyEntry {
    pub provider: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_true")]
    pub requires_history: bool,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_strategies() -> BTreeMap<String, StrategyEntry> {
    let entry = |requires_history| StrategyEntry {
        provider: "openai".to_string(),
        model: "gpt-4o".to_string(),
        temperature: default_temperature(),
        requires_history,
    };
    BTreeMap::from([
        (Intention::RandomMessage.as_str().to_string(), entry(true)),
        (Intention::HostileMessage.as_str().to_string(), entry(false)),
        (Intention::Question.as_str().to_string(), entry(true)),
    ])
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of chunks requested from the vector index.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_hypothetical_max_tokens")]
    pub hypothetical_max_tokens: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            hypothetical_max_tokens: default_hypothetical_max_tokens(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_hypothetical_max_tokens() -> u32 {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `"pinecone"` or `"memory"`.
    #[serde(default = "default_index_provider")]
    pub provider: String,
    /// Pinecone index host, e.g. `https://my-index-abc123.svc.us-east1.pinecone.io`.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    /// JSON file of chunks with embeddings, for the in-memory index.
    #[serde(default)]
    pub path: Option<std::path::PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            provider: default_index_provider(),
            host: None,
            namespace: None,
            path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_index_provider() -> String {
    "pinecone".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvidersConfig {
    #[serde(default = "default_openai_url")]
    pub openai_base_url: String,
    #[serde(default = "default_fireworks_url")]
    pub fireworks_base_url: String,
    #[serde(default = "default_anthropic_url")]
    pub anthropic_base_url: String,
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,
    /// Timeout for non-streaming calls (classification, generation, embeddings).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for embedding calls on 429/5xx/network errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai_base_url: default_openai_url(),
            fireworks_base_url: default_fireworks_url(),
            anthropic_base_url: default_anthropic_url(),
            anthropic_version: default_anthropic_version(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_fireworks_url() -> String {
    "https://api.fireworks.ai/inference/v1".to_string()
}
fn default_anthropic_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}
fn default_anthropic_version() -> String {
    "2023-06-01".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

/// Parse configuration from TOML text and validate it.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;
    let mut strategies = default_strategies();
    for (label, entry) in std::mem::take(&mut config.strategies) {
        let key = match Intention::from_label(&label) {
            Intention::Unknown => label,
            intention => intention.as_str().to_string(),
        };
        strategies.insert(key, entry);
    }
    config.strategies = strategies;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    if config.chat.history_window == 0 {
        bail!("chat.history_window must be >= 1");
    }
    if config.chat.max_tokens == 0 {
        bail!("chat.max_tokens must be >= 1");
    }
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.server.request_timeout_secs == 0 {
        bail!("server.request_timeout_secs must be >= 1");
    }

    for (label, entry) in &config.strategies {
        if Intention::from_label(label) == Intention::Unknown {
            bail!(
                "Unknown strategy '{}'. Must be one of: {}",
                label,
                Intention::KNOWN
                    .iter()
                    .map(|i| i.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        if !(0.0..=2.0).contains(&entry.temperature) {
            bail!("strategies.{}.temperature must be in [0.0, 2.0]", label);
        }
        if entry.model.trim().is_empty() {
            bail!("strategies.{}.model must not be empty", label);
        }
    }
    if !config
        .strategies
        .contains_key(Intention::RandomMessage.as_str())
    {
        bail!("strategies.random_message must be configured (it is the fallback strategy)");
    }

    if !config.prompts.question.contains("{context}") {
        bail!("prompts.question must contain a {{context}} placeholder");
    }

    match config.index.provider.as_str() {
        "pinecone" => {
            if config.index.host.is_none() {
                bail!("index.host must be set when index.provider is 'pinecone'");
            }
        }
        "memory" => {
            if config.index.path.is_none() {
                bail!("index.path must be set when index.provider is 'memory'");
            }
        }
        other => bail!(
            "Unknown index provider: '{}'. Must be pinecone or memory.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMORY_INDEX: &str = r#"
[index]
provider = "memory"
path = "/tmp/chunks.json"
"#;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let cfg = parse_config(MEMORY_INDEX).unwrap();
        assert_eq!(cfg.chat.history_window, 7);
        assert_eq!(cfg.chat.max_tokens, 4096);
        assert_eq!(cfg.server.request_timeout_secs, 60);
        assert_eq!(cfg.strategies.len(), 3);
        assert!(!cfg.strategies["hostile_message"].requires_history);
    }

    #[test]
    fn test_strategy_override() {
        let toml = format!(
            "{}\n[strategies.question]\nprovider = \"anthropic\"\nmodel = \"claude-3-5-sonnet-latest\"\ntemperature = 0.2\n\n[strategies.random_message]\nprovider = \"openai\"\nmodel = \"gpt-4o\"\n",
            MEMORY_INDEX
        );
        let cfg = parse_config(&toml).unwrap();
        let q = &cfg.strategies["question"];
        assert_eq!(q.provider, "anthropic");
        assert!((q.temperature - 0.2).abs() < f32::EPSILON);
        assert!(q.requires_history);
    }

    #[test]
    fn test_single_strategy_override_keeps_builtin_rows() {
        let toml = format!(
            "{}\n[strategies.question]\nprovider = \"anthropic\"\nmodel = \"claude-3-5-sonnet-latest\"\n",
            MEMORY_INDEX
        );
        let cfg = parse_config(&toml).unwrap();
        assert_eq!(cfg.strategies.len(), 3);
        assert_eq!(cfg.strategies["question"].provider, "anthropic");
        assert_eq!(cfg.strategies["random_message"].provider, "openai");
        assert!(!cfg.strategies["hostile_message"].requires_history);
    }

    #[test]
    fn test_strategy_alias_replaces_canonical_row() {
        let toml = format!(
            "{}\n[strategies.random]\nprovider = \"fireworks\"\nmodel = \"llama-v3p1-8b\"\n",
            MEMORY_INDEX
        );
        let cfg = parse_config(&toml).unwrap();
        assert_eq!(cfg.strategies.len(), 3);
        assert_eq!(cfg.strategies["random_message"].provider, "fireworks");
    }

    #[test]
    fn test_missing_random_strategy_rejected() {
        let mut cfg = parse_config(MEMORY_INDEX).unwrap();
        cfg.strategies.remove("random_message");
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("random_message"));
    }

    #[test]
    fn test_unknown_strategy_label_rejected() {
        let toml = format!(
            "{}\n[strategies.smalltalk]\nprovider = \"openai\"\nmodel = \"gpt-4o\"\n",
            MEMORY_INDEX
        );
        let err = parse_config(&toml).unwrap_err();
        assert!(err.to_string().contains("smalltalk"));
    }

    #[test]
    fn test_unknown_index_provider_rejected() {
        let err = parse_config("[index]\nprovider = \"faiss\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown index provider"));
    }

    #[test]
    fn test_pinecone_requires_host() {
        let err = parse_config("[index]\nprovider = \"pinecone\"\n").unwrap_err();
        assert!(err.to_string().contains("index.host"));
    }

    #[test]
    fn test_zero_history_window_rejected() {
        let toml = format!("{}\n[chat]\nhistory_window = 0\n", MEMORY_INDEX);
        assert!(parse_config(&toml).is_err());
    }

    #[test]
    fn test_question_prompt_requires_placeholder() {
        let toml = format!("{}\n[prompts]\nquestion = \"no slot here\"\n", MEMORY_INDEX);
        let err = parse_config(&toml).unwrap_err();
        assert!(err.to_string().contains("{context}"));
    }
}
