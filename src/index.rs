//! Vector index backends.
//!
//! [`VectorIndex`] is the search seam used by retrieval:
//! - **[`PineconeIndex`]**: queries a hosted Pinecone index over HTTP.
//! - **[`InMemoryIndex`]**: brute-force cosine similarity over vectors
//!   loaded from a JSON file. Used for local runs and tests.
//!
//! Both return chunks with their metadata and score, best match first.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use crate::embedding::cosine_similarity;
use crate::models::Chunk;

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Backend name for logs (`"pinecone"`, `"memory"`).
    fn name(&self) -> &str;

    /// The `top_k` nearest chunks to `vector`, highest score first.
    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<Chunk>>;
}

// ============ Pinecone ============

/// Pinecone data-plane client for a single index host.
pub struct PineconeIndex {
    http: reqwest::Client,
    host: String,
    api_key: String,
    namespace: Option<String>,
}

impl PineconeIndex {
    pub fn new(
        host: impl Into<String>,
        api_key: impl Into<String>,
        namespace: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut host = host.into().trim_end_matches('/').to_string();
        if !host.starts_with("http://") && !host.starts_with("https://") {
            host = format!("https://{}", host);
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            host,
            api_key: api_key.into(),
            namespace,
        })
    }

    fn query_body(&self, vector: &[f32], top_k: usize) -> Value {
        let mut body = json!({
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
            "includeValues": false,
        });
        if let Some(ns) = &self.namespace {
            body["namespace"] = json!(ns);
        }
        body
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    fn name(&self) -> &str {
        "pinecone"
    }

    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<Chunk>> {
        let response = self
            .http
            .post(format!("{}/query", self.host))
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", "2024-07")
            .json(&self.query_body(vector, top_k))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Pinecone query error {}: {}", status, body);
        }

        let json: Value = response.json().await?;
        parse_pinecone_matches(&json)
    }
}

/// Convert a Pinecone query response into chunks.
///
/// Matches without `text` metadata are skipped.
fn parse_pinecone_matches(json: &Value) -> Result<Vec<Chunk>> {
    let matches = json
        .get("matches")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("Invalid Pinecone response: missing matches"))?;

    let str_field = |meta: &Value, key: &str| -> String {
        meta.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let mut chunks = Vec::with_capacity(matches.len());
    for m in matches {
        let id = m.get("id").and_then(Value::as_str).unwrap_or_default();
        let Some(meta) = m.get("metadata") else {
            tracing::warn!(id, "pinecone match without metadata; skipping");
            continue;
        };
        let text = str_field(meta, "text");
        if text.is_empty() {
            tracing::warn!(id, "pinecone match without text; skipping");
            continue;
        }
        chunks.push(Chunk {
            id: id.to_string(),
            text,
            source_url: str_field(meta, "source_url"),
            source_description: str_field(meta, "source_description"),
            order: meta.get("order").and_then(Value::as_f64).unwrap_or(0.0) as i64,
            pre_context: str_field(meta, "pre_context"),
            post_context: str_field(meta, "post_context"),
            score: m.get("score").and_then(Value::as_f64).unwrap_or(0.0),
        });
    }
    Ok(chunks)
}

// ============ In-memory ============

/// One record of the in-memory index file.
#[derive(Debug, Deserialize)]
pub struct IndexRecord {
    #[serde(flatten)]
    pub chunk: Chunk,
    pub values: Vec<f32>,
}

struct StoredVector {
    chunk: Chunk,
    vector: Vec<f32>,
}

/// Brute-force cosine similarity index.
#[derive(Default)]
pub struct InMemoryIndex {
    vectors: RwLock<Vec<StoredVector>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of [`IndexRecord`]s.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read index file: {}", path.display()))?;
        let records: Vec<IndexRecord> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse index file: {}", path.display()))?;

        let index = Self::new();
        for record in records {
            index.insert(record.chunk, record.values)?;
        }
        Ok(index)
    }

    /// Add or replace a chunk (by id).
    pub fn insert(&self, chunk: Chunk, vector: Vec<f32>) -> Result<()> {
        let mut vectors = self
            .vectors
            .write()
            .map_err(|_| anyhow::anyhow!("in-memory index lock poisoned"))?;
        if let Some(first) = vectors.first() {
            if first.vector.len() != vector.len() {
                bail!(
                    "vector for chunk '{}' has {} dims, index has {}",
                    chunk.id,
                    vector.len(),
                    first.vector.len()
                );
            }
        }
        vectors.retain(|sv| sv.chunk.id != chunk.id);
        vectors.push(StoredVector { chunk, vector });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.vectors.read().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn name(&self) -> &str {
        "memory"
    }

    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<Chunk>> {
        let vectors = self
            .vectors
            .read()
            .map_err(|_| anyhow::anyhow!("in-memory index lock poisoned"))?;

        let mut scored: Vec<Chunk> = vectors
            .iter()
            .map(|sv| {
                let mut chunk = sv.chunk.clone();
                chunk.score = cosine_similarity(vector, &sv.vector) as f64;
                chunk
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}
