//! Prompt templates.
//!
//! Templates are opaque strings supplied by configuration. Two placeholders
//! are substituted: `{ai_name}` and `{owner_name}` everywhere, and
//! `{context}` in the question template.

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct PromptsConfig {
    #[serde(default = "default_ai_name")]
    pub ai_name: String,
    #[serde(default = "default_owner_name")]
    pub owner_name: String,
    #[serde(default = "default_owner_description")]
    pub owner_description: String,
    #[serde(default = "default_intention")]
    pub intention: String,
    #[serde(default = "default_random_message")]
    pub random_message: String,
    #[serde(default = "default_hostile_message")]
    pub hostile_message: String,
    #[serde(default = "default_question")]
    pub question: String,
    #[serde(default = "default_question_backup")]
    pub question_backup: String,
    #[serde(default = "default_hypothetical")]
    pub hypothetical: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            ai_name: default_ai_name(),
            owner_name: default_owner_name(),
            owner_description: default_owner_description(),
            intention: default_intention(),
            random_message: default_random_message(),
            hostile_message: default_hostile_message(),
            question: default_question(),
            question_backup: default_question_backup(),
            hypothetical: default_hypothetical(),
        }
    }
}

fn default_ai_name() -> String {
    "Relay".to_string()
}
fn default_owner_name() -> String {
    "the site owner".to_string()
}
fn default_owner_description() -> String {
    "a domain expert who curated the reference documents".to_string()
}
fn default_intention() -> String {
    "You are {ai_name}, an assistant built by {owner_name}. Classify the user's most recent \
     message. Use `question` when the user asks for information, `hostile_message` when the \
     message is abusive or hostile, and `random_message` for anything else."
        .to_string()
}
fn default_random_message() -> String {
    "You are {ai_name}, an assistant built by {owner_name}, {owner_description}. The user sent \
     a message that is not a question. Respond briefly and warmly, and invite them to ask a \
     question."
        .to_string()
}
fn default_hostile_message() -> String {
    "You are {ai_name}, an assistant built by {owner_name}. The user is being hostile. Do not \
     engage with the hostility; reply politely and briefly, and offer to help with a question."
        .to_string()
}
fn default_question() -> String {
    "You are {ai_name}, an assistant built by {owner_name}, {owner_description}. Answer the \
     user's question using the excerpts below. Cite excerpts inline with their bracketed number, \
     e.g. [1]. If the excerpts do not contain the answer, say so and answer from general \
     knowledge with a note that no source was found.\n\nExcerpts:\n{context}"
        .to_string()
}
fn default_question_backup() -> String {
    "You are {ai_name}, an assistant built by {owner_name}. Document search is unavailable \
     right now. Answer the user's question from general knowledge and mention that you could \
     not consult the reference documents."
        .to_string()
}
fn default_hypothetical() -> String {
    "Write a short, plausible answer to the user's latest question as it might appear in a \
     reference document. Do not mention that the answer is hypothetical. Answer only; do not \
     restate the question."
        .to_string()
}

impl PromptsConfig {
    fn fill(&self, template: &str) -> String {
        template
            .replace("{ai_name}", &self.ai_name)
            .replace("{owner_name}", &self.owner_name)
            .replace("{owner_description}", &self.owner_description)
    }

    pub fn intention_prompt(&self) -> String {
        self.fill(&self.intention)
    }

    pub fn random_message_prompt(&self) -> String {
        self.fill(&self.random_message)
    }

    pub fn hostile_message_prompt(&self) -> String {
        self.fill(&self.hostile_message)
    }

    /// The question prompt with retrieved context injected.
    pub fn question_prompt(&self, context: &str) -> String {
        // Identity first so that `{...}` sequences inside context are left alone.
        self.fill(&self.question).replace("{context}", context)
    }

    pub fn question_backup_prompt(&self) -> String {
        self.fill(&self.question_backup)
    }

    pub fn hypothetical_prompt(&self) -> String {
        self.fill(&self.hypothetical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_substitution() {
        let prompts = PromptsConfig {
            ai_name: "Just Gaff".to_string(),
            ..Default::default()
        };
        let p = prompts.random_message_prompt();
        assert!(p.contains("Just Gaff"));
        assert!(!p.contains("{ai_name}"));
    }

    #[test]
    fn test_context_injection_is_literal() {
        let prompts = PromptsConfig::default();
        let p = prompts.question_prompt("[1] text with {ai_name} inside");
        assert!(p.contains("[1] text with {ai_name} inside"));
        assert!(!p.contains("{context}"));
    }
}
