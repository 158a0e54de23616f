//! Retrieval-augmented grounding for question turns.
//!
//! The pipeline is HyDE-style: a model first writes a plausible answer to
//! the latest question, that hypothetical answer is embedded, and the
//! embedding is used to search the vector index. Documents that read like
//! an answer are found more reliably than documents that read like the
//! question.
//!
//! ```text
//! chat ─▶ hypothetical answer ─▶ embedding ─▶ top-k chunks
//!                                                 │
//!                        sources ◀── group by source_url
//!                           │
//!              citations [1..n] + context block
//! ```
//!
//! Each step is exposed separately so the caller can report progress
//! between them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::embedding::Embedder;
use crate::index::VectorIndex;
use crate::models::{strip_citations, Chat, Chunk, Citation, Source};
use crate::providers::{CompletionModel, CompletionRequest, ProviderError};

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Couldn't work out what to look for")]
    Hypothetical(#[source] ProviderError),

    #[error("Couldn't prepare the document search")]
    Embedding(#[source] anyhow::Error),

    #[error("Couldn't search the documents")]
    Search(#[source] anyhow::Error),
}

/// Grounding material derived from the retrieved chunks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grounding {
    pub sources: Vec<Source>,
    /// One per source, numbered in source rank order.
    pub citations: Vec<Citation>,
    /// Text block injected into the question prompt.
    pub context: String,
}

impl Grounding {
    pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
        let sources = aggregate_sources(chunks);
        let citations = extract_citations(&sources);
        let context = assemble_context(&sources);
        Self {
            sources,
            citations,
            context,
        }
    }
}

pub struct RetrievalPipeline {
    generator: Arc<dyn CompletionModel>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    hypothetical_model: String,
    hypothetical_prompt: String,
    hypothetical_max_tokens: u32,
    history_window: usize,
    top_k: usize,
}

/// Settings for [`RetrievalPipeline::new`].
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub hypothetical_model: String,
    pub hypothetical_prompt: String,
    pub hypothetical_max_tokens: u32,
    pub history_window: usize,
    pub top_k: usize,
}

impl RetrievalPipeline {
    pub fn new(
        generator: Arc<dyn CompletionModel>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            generator,
            embedder,
            index,
            hypothetical_model: settings.hypothetical_model,
            hypothetical_prompt: settings.hypothetical_prompt,
            hypothetical_max_tokens: settings.hypothetical_max_tokens,
            history_window: settings.history_window,
            top_k: settings.top_k,
        }
    }

    /// Write a plausible answer to the latest question.
    pub async fn hypothetical_answer(&self, chat: &Chat) -> Result<String, RetrievalError> {
        let request = CompletionRequest {
            model: self.hypothetical_model.clone(),
            system: self.hypothetical_prompt.clone(),
            messages: strip_citations(chat.recent(self.history_window)),
            temperature: None,
            max_tokens: Some(self.hypothetical_max_tokens),
        };
        let answer = self
            .generator
            .complete(&request)
            .await
            .map_err(RetrievalError::Hypothetical)?;
        tracing::debug!(chars = answer.len(), "hypothetical answer generated");
        Ok(answer)
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let vector = self
            .embedder
            .embed(text)
            .await
            .map_err(RetrievalError::Embedding)?;
        tracing::debug!(model = self.embedder.model_name(), dims = vector.len(), "text embedded");
        Ok(vector)
    }

    /// Nearest chunks, best first, at most `top_k`.
    pub async fn search(&self, vector: &[f32]) -> Result<Vec<Chunk>, RetrievalError> {
        let mut chunks = self
            .index
            .search(vector, self.top_k)
            .await
            .map_err(RetrievalError::Search)?;
        chunks.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        chunks.truncate(self.top_k);
        tracing::debug!(index = self.index.name(), hits = chunks.len(), "index searched");
        Ok(chunks)
    }
}

/// Group chunks by `source_url`.
///
/// Sources are ranked by their best chunk score, ties broken by first
/// appearance. Chunks inside a source are ordered by position in the
/// document.
pub fn aggregate_sources(chunks: Vec<Chunk>) -> Vec<Source> {
    let mut sources: Vec<Source> = Vec::new();
    let mut by_url: HashMap<String, usize> = HashMap::new();

    for chunk in chunks {
        match by_url.get(&chunk.source_url) {
            Some(&i) => {
                let source = &mut sources[i];
                if chunk.score > source.score {
                    source.score = chunk.score;
                }
                if source.source_description.is_empty() {
                    source.source_description = chunk.source_description.clone();
                }
                source.chunks.push(chunk);
            }
            None => {
                by_url.insert(chunk.source_url.clone(), sources.len());
                sources.push(Source {
                    source_url: chunk.source_url.clone(),
                    source_description: chunk.source_description.clone(),
                    score: chunk.score,
                    chunks: vec![chunk],
                });
            }
        }
    }

    for source in &mut sources {
        source.chunks.sort_by_key(|c| c.order);
    }
    // Stable sort keeps first-appearance order among equal scores.
    sources.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    sources
}

/// One citation per source, numbered from 1 in rank order.
pub fn extract_citations(sources: &[Source]) -> Vec<Citation> {
    sources
        .iter()
        .enumerate()
        .map(|(i, s)| Citation {
            ordinal: i + 1,
            source_url: s.source_url.clone(),
            source_description: s.source_description.clone(),
        })
        .collect()
}

/// Render sources as numbered excerpts for the question prompt.
///
/// Markers match citation ordinals, so `[n]` in the answer refers to the
/// n-th citation.
pub fn assemble_context(sources: &[Source]) -> String {
    let mut blocks = Vec::with_capacity(sources.len());
    for (i, source) in sources.iter().enumerate() {
        let mut block = format!("[{}]", i + 1);
        if !source.source_description.is_empty() {
            block.push(' ');
            block.push_str(&source.source_description);
        }
        if !source.source_url.is_empty() {
            block.push_str(&format!(" ({})", source.source_url));
        }
        for chunk in &source.chunks {
            for part in [&chunk.pre_context, &chunk.text, &chunk.post_context] {
                let part = part.trim();
                if !part.is_empty() {
                    block.push('\n');
                    block.push_str(part);
                }
            }
        }
        blocks.push(block);
    }
    blocks.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(url: &str, order: i64, score: f64, text: &str) -> Chunk {
        Chunk {
            id: format!("{}#{}", url, order),
            text: text.to_string(),
            source_url: url.to_string(),
            source_description: format!("About {}", url),
            order,
            pre_context: String::new(),
            post_context: String::new(),
            score,
        }
    }

    #[test]
    fn test_aggregate_groups_and_ranks() {
        let sources = aggregate_sources(vec![
            chunk("b", 5, 0.80, "b5"),
            chunk("a", 2, 0.90, "a2"),
            chunk("b", 1, 0.95, "b1"),
            chunk("c", 0, 0.10, "c0"),
        ]);

        let urls: Vec<&str> = sources.iter().map(|s| s.source_url.as_str()).collect();
        assert_eq!(urls, vec!["b", "a", "c"]);
        assert!((sources[0].score - 0.95).abs() < 1e-9);
        let orders: Vec<i64> = sources[0].chunks.iter().map(|c| c.order).collect();
        assert_eq!(orders, vec![1, 5]);
    }

    #[test]
    fn test_aggregate_ties_keep_first_appearance() {
        let sources = aggregate_sources(vec![
            chunk("x", 0, 0.5, "x"),
            chunk("y", 0, 0.5, "y"),
        ]);
        assert_eq!(sources[0].source_url, "x");
        assert_eq!(sources[1].source_url, "y");
    }

    #[test]
    fn test_citations_are_dense_and_one_based() {
        let sources = aggregate_sources(vec![
            chunk("a", 0, 0.3, "a"),
            chunk("b", 0, 0.9, "b"),
            chunk("a", 1, 0.2, "a1"),
        ]);
        let citations = extract_citations(&sources);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].ordinal, 1);
        assert_eq!(citations[0].source_url, "b");
        assert_eq!(citations[1].ordinal, 2);
        assert_eq!(citations[1].source_description, "About a");
    }

    #[test]
    fn test_context_markers_match_citations() {
        let mut first = chunk("https://rules/balk", 0, 0.9, "A balk is an illegal act.");
        first.pre_context = "Rule 6.02".to_string();
        let grounding = Grounding::from_chunks(vec![
            first,
            chunk("https://rules/pitch", 0, 0.4, "The pitcher shall..."),
        ]);

        assert!(grounding
            .context
            .starts_with("[1] About https://rules/balk (https://rules/balk)\nRule 6.02\nA balk"));
        assert!(grounding.context.contains("\n\n[2] About https://rules/pitch"));
        assert_eq!(grounding.citations[1].source_url, "https://rules/pitch");
    }

    #[test]
    fn test_empty_retrieval() {
        let grounding = Grounding::from_chunks(vec![]);
        assert!(grounding.sources.is_empty());
        assert!(grounding.citations.is_empty());
        assert_eq!(grounding.context, "");
    }
}
