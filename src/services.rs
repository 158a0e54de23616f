//! Long-lived service handles built once at startup.
//!
//! API keys come from the environment only:
//!
//! | Variable            | Required                        |
//! |---------------------|---------------------------------|
//! | `OPENAI_API_KEY`    | always                          |
//! | `PINECONE_API_KEY`  | when `index.provider = "pinecone"` |
//! | `ANTHROPIC_API_KEY` | to register the `anthropic` provider |
//! | `FIREWORKS_API_KEY` | to register the `fireworks` provider |
//!
//! Optional providers that have no key are left out of the registry; a
//! strategy naming one fails at request time with a "not configured" error.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::StreamAdapter;
use crate::config::Config;
use crate::embedding::{Embedder, OpenAiEmbedder};
use crate::index::{InMemoryIndex, PineconeIndex, VectorIndex};
use crate::intention::IntentionClassifier;
use crate::orchestrator::Responder;
use crate::providers::anthropic::AnthropicClient;
use crate::providers::openai::OpenAiClient;
use crate::providers::{CompletionModel, ProviderRegistry};
use crate::retrieval::{RetrievalPipeline, RetrievalSettings};
use crate::strategy::StrategyTable;

pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const PINECONE_API_KEY: &str = "PINECONE_API_KEY";
pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const FIREWORKS_API_KEY: &str = "FIREWORKS_API_KEY";

/// Secrets, read from the environment or supplied directly in tests.
#[derive(Clone, Default)]
pub struct Secrets {
    values: HashMap<&'static str, String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        let mut values = HashMap::new();
        for key in [
            OPENAI_API_KEY,
            PINECONE_API_KEY,
            ANTHROPIC_API_KEY,
            FIREWORKS_API_KEY,
        ] {
            if let Ok(v) = std::env::var(key) {
                if !v.trim().is_empty() {
                    values.insert(key, v);
                }
            }
        }
        Self { values }
    }

    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.values.insert(key, value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Names of required variables that are not set.
    pub fn missing(&self, config: &Config) -> Vec<&'static str> {
        let mut required = vec![OPENAI_API_KEY];
        if config.index.provider == "pinecone" {
            required.push(PINECONE_API_KEY);
        }
        required
            .into_iter()
            .filter(|k| self.get(k).is_none())
            .collect()
    }
}

/// The network-facing collaborators of a [`Responder`].
pub struct ServiceParts {
    /// Classification and hypothetical-answer model.
    pub completion: Arc<dyn CompletionModel>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub providers: ProviderRegistry,
}

impl ServiceParts {
    /// Build real clients from config and secrets.
    pub fn connect(config: &Config, secrets: &Secrets) -> Result<Self> {
        let missing = secrets.missing(config);
        if !missing.is_empty() {
            bail!(
                "Missing required environment variables: {}",
                missing.join(", ")
            );
        }
        let openai_key = secrets.get(OPENAI_API_KEY).unwrap_or_default();
        let timeout = Duration::from_secs(config.providers.timeout_secs);

        let openai = Arc::new(OpenAiClient::new(
            "openai",
            &config.providers.openai_base_url,
            openai_key,
            timeout,
        )?);

        let mut providers = ProviderRegistry::new();
        providers.register(openai.clone());

        if let Some(key) = secrets.get(FIREWORKS_API_KEY) {
            providers.register(Arc::new(OpenAiClient::new(
                "fireworks",
                &config.providers.fireworks_base_url,
                key,
                timeout,
            )?));
        }
        if let Some(key) = secrets.get(ANTHROPIC_API_KEY) {
            providers.register(Arc::new(AnthropicClient::new(
                &config.providers.anthropic_base_url,
                key,
                &config.providers.anthropic_version,
                timeout,
            )?));
        }

        let embedder = Arc::new(OpenAiEmbedder::new(
            &config.providers.openai_base_url,
            openai_key,
            &config.models.embedding_model,
            timeout,
            config.providers.max_retries,
        )?);

        let index = build_index(config, secrets)?;

        Ok(Self {
            completion: openai,
            embedder,
            index,
            providers,
        })
    }
}

fn build_index(config: &Config, secrets: &Secrets) -> Result<Arc<dyn VectorIndex>> {
    let index: Arc<dyn VectorIndex> = match config.index.provider.as_str() {
        "pinecone" => {
            let host = config
                .index
                .host
                .as_deref()
                .context("index.host required for the pinecone index")?;
            Arc::new(PineconeIndex::new(
                host,
                secrets.get(PINECONE_API_KEY).unwrap_or_default(),
                config.index.namespace.clone(),
                Duration::from_secs(config.index.timeout_secs),
            )?)
        }
        "memory" => {
            let path = config
                .index
                .path
                .as_deref()
                .context("index.path required for the memory index")?;
            let index = InMemoryIndex::from_file(path)?;
            tracing::info!(path = %path.display(), chunks = index.len(), "loaded in-memory index");
            Arc::new(index)
        }
        other => bail!("Unknown index provider: {}", other),
    };
    Ok(index)
}

/// Assemble a [`Responder`] from config and its collaborators.
pub fn build_responder(config: &Config, parts: ServiceParts) -> Result<Responder> {
    let prompts = config.prompts.clone();
    let history_window = config.chat.history_window;

    let classifier = IntentionClassifier::new(
        parts.completion.clone(),
        &config.models.intention_model,
        prompts.intention_prompt(),
        history_window,
    );
    let strategies = StrategyTable::from_config(config)?;

    let retrieval = RetrievalPipeline::new(
        parts.completion,
        parts.embedder,
        parts.index,
        RetrievalSettings {
            hypothetical_model: config.models.hypothetical_model.clone(),
            hypothetical_prompt: prompts.hypothetical_prompt(),
            hypothetical_max_tokens: config.retrieval.hypothetical_max_tokens,
            history_window,
            top_k: config.retrieval.top_k,
        },
    );

    let adapter = StreamAdapter::new(
        parts.providers,
        config.chat.max_tokens,
        &config.chat.default_response_message,
        config.chat.log_streams,
    );

    Ok(Responder::new(
        classifier,
        strategies,
        retrieval,
        adapter,
        prompts,
        history_window,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn test_missing_keys_listed() {
        let config = Config::minimal();
        let missing = Secrets::default().missing(&config);
        assert_eq!(missing, vec![OPENAI_API_KEY, PINECONE_API_KEY]);

        let secrets = Secrets::default().with(OPENAI_API_KEY, "sk");
        assert_eq!(secrets.missing(&config), vec![PINECONE_API_KEY]);
    }

    #[test]
    fn test_memory_index_does_not_need_pinecone_key() {
        let config = parse_config(
            r#"
[index]
provider = "memory"
path = "/tmp/does-not-matter.json"
"#,
        )
        .unwrap();
        let secrets = Secrets::default().with(OPENAI_API_KEY, "sk");
        assert!(secrets.missing(&config).is_empty());
    }

    #[test]
    fn test_connect_fails_fast_on_missing_keys() {
        let err = ServiceParts::connect(&Config::minimal(), &Secrets::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn test_optional_providers_registered_only_with_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, "[]").unwrap();
        let config = parse_config(&format!(
            "[index]\nprovider = \"memory\"\npath = \"{}\"\n",
            path.display()
        ))
        .unwrap();

        let secrets = Secrets::default()
            .with(OPENAI_API_KEY, "sk")
            .with(ANTHROPIC_API_KEY, "ak");
        let parts = ServiceParts::connect(&config, &secrets).unwrap();
        assert_eq!(parts.providers.names(), vec!["anthropic", "openai"]);
        assert_eq!(parts.index.name(), "memory");
    }
}
