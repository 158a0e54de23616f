//! Static mapping from [`Intention`] to response configuration.
//!
//! The table is built once from config and never mutated. Resolution is
//! total: any intention without its own row gets the random-message row.

use anyhow::{anyhow, Result};
use std::collections::HashMap;

use crate::config::Config;
use crate::intention::Intention;

/// How to answer one kind of turn.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    /// Whether recent chat history is sent along with the system prompt.
    pub requires_history: bool,
}

#[derive(Debug, Clone)]
pub struct StrategyTable {
    entries: HashMap<Intention, StrategyConfig>,
    fallback: StrategyConfig,
}

impl StrategyTable {
    /// Build a table with an explicit fallback row.
    pub fn new(entries: HashMap<Intention, StrategyConfig>, fallback: StrategyConfig) -> Self {
        Self { entries, fallback }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mut entries = HashMap::new();
        for (label, entry) in &config.strategies {
            let intention = Intention::from_label(label);
            if intention == Intention::Unknown {
                continue;
            }
            entries.insert(
                intention,
                StrategyConfig {
                    provider: entry.provider.clone(),
                    model: entry.model.clone(),
                    temperature: entry.temperature,
                    requires_history: entry.requires_history,
                },
            );
        }

        let fallback = entries
            .get(&Intention::RandomMessage)
            .cloned()
            .ok_or_else(|| anyhow!("strategies.random_message must be configured"))?;

        Ok(Self { entries, fallback })
    }

    pub fn resolve(&self, intention: Intention) -> &StrategyConfig {
        self.entries.get(&intention).unwrap_or(&self.fallback)
    }
}
