//! Query-time retrieval of knowledge-base chunks.
//!
//! The [`Retriever`] only orchestrates: it embeds the query through an
//! [`Embedder`] and asks a [`VectorIndex`] for the nearest neighbours. Both are
//! injected so deployments can swap services and tests can use fakes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::http_client::build_http_client_with_timeout;

/// A knowledge chunk selected for one turn. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub source_id: String,
    pub text: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalFilters {
    /// Exact-match constraints on chunk metadata.
    pub metadata: BTreeMap<String, String>,
    pub min_score: Option<f32>,
}

impl RetrievalFilters {
    pub fn with_min_score(min_score: Option<f32>) -> Self {
        Self {
            metadata: BTreeMap::new(),
            min_score,
        }
    }
}

/// Text → vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Nearest-neighbour lookup over pre-computed embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn nearest(
        &self,
        vector: &[f32],
        k: usize,
        filters: &RetrievalFilters,
    ) -> Result<Vec<RetrievedChunk>>;
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    timeout: Duration,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, timeout: Duration) -> Self {
        Self {
            embedder,
            index,
            timeout,
        }
    }

    /// Top-`k` chunks for `query_text`, by descending score.
    ///
    /// Any collaborator failure or timeout is reported as
    /// [`EngineError::RetrievalUnavailable`]; callers fall back to no context.
    pub async fn retrieve(
        &self,
        query_text: &str,
        k: usize,
        filters: &RetrievalFilters,
    ) -> EngineResult<Vec<RetrievedChunk>> {
        if query_text.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let lookup = async {
            let vector = self
                .embedder
                .embed(query_text)
                .await
                .context("embedding request failed")?;
            self.index
                .nearest(&vector, k, filters)
                .await
                .context("vector search failed")
        };

        let mut chunks = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(chunks)) => chunks,
            Ok(Err(error)) => return Err(EngineError::RetrievalUnavailable(format!("{:#}", error))),
            Err(_) => {
                return Err(EngineError::RetrievalUnavailable(format!(
                    "timed out after {:?}",
                    self.timeout
                )))
            }
        };

        if let Some(min_score) = filters.min_score {
            chunks.retain(|chunk| chunk.score >= min_score);
        }
        // Stable sort keeps the index's order among equal scores.
        chunks.sort_by(|a, b| b.score.total_cmp(&a.score));
        chunks.truncate(k);

        tracing::debug!(
            "Retrieved {} chunk(s) for query ({} chars)",
            chunks.len(),
            query_text.len()
        );
        Ok(chunks)
    }
}

// ============================================================================
// OpenAI-compatible embeddings (Voyage, OpenAI, Ollama, ...)
// ============================================================================

#[derive(Clone)]
pub struct HttpEmbedder {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(
        api_url: String,
        api_key: Option<String>,
        model: String,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.unwrap_or_default(),
            model,
            client: build_http_client_with_timeout(Some(timeout))?,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.api_url);
        let request = EmbeddingRequest {
            model: &self.model,
            input: vec![text],
        };

        let mut req = self.client.post(&url).json(&request);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send embedding request")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Embedding API returned error {}: {}", status, body);
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow::anyhow!("Embedding API returned no vectors"))
    }
}

// ============================================================================
// Qdrant REST search
// ============================================================================

#[derive(Clone)]
pub struct QdrantIndex {
    base_url: String,
    api_key: Option<String>,
    collection: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct QdrantSearchResponse {
    #[serde(default)]
    result: Vec<QdrantPoint>,
}

#[derive(Debug, Deserialize)]
struct QdrantPoint {
    id: serde_json::Value,
    score: f32,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    #[serde(default)]
    vector: Option<serde_json::Value>,
}

impl QdrantIndex {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        collection: String,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            collection,
            client: build_http_client_with_timeout(Some(timeout))?,
        })
    }

    fn search_body(vector: &[f32], k: usize, filters: &RetrievalFilters) -> serde_json::Value {
        let mut body = serde_json::json!({
            "vector": vector,
            "limit": k,
            "with_payload": true,
            "with_vector": true,
        });
        if !filters.metadata.is_empty() {
            let must: Vec<serde_json::Value> = filters
                .metadata
                .iter()
                .map(|(key, value)| {
                    serde_json::json!({
                        "key": format!("metadata.{}", key),
                        "match": { "value": value }
                    })
                })
                .collect();
            body["filter"] = serde_json::json!({ "must": must });
        }
        if let Some(min_score) = filters.min_score {
            body["score_threshold"] = serde_json::json!(min_score);
        }
        body
    }
}

fn point_to_chunk(point: QdrantPoint) -> Option<RetrievedChunk> {
    let payload = point.payload.unwrap_or(serde_json::Value::Null);
    let text = payload
        .get("page_content")
        .or_else(|| payload.get("text"))
        .and_then(|v| v.as_str())?
        .to_string();

    let source_id = payload
        .get("metadata")
        .and_then(|m| m.get("source"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| match &point.id {
            serde_json::Value::String(id) => id.clone(),
            other => other.to_string(),
        });

    // Unnamed vectors come back as a plain array; named ones as an object.
    let embedding = match point.vector {
        Some(serde_json::Value::Array(values)) => Some(
            values
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect::<Vec<_>>(),
        ),
        Some(serde_json::Value::Object(named)) => named.values().next().and_then(|v| {
            v.as_array().map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect::<Vec<_>>()
            })
        }),
        _ => None,
    }
    .filter(|v| !v.is_empty());

    Some(RetrievedChunk {
        source_id,
        text,
        score: point.score,
        embedding,
    })
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn nearest(
        &self,
        vector: &[f32],
        k: usize,
        filters: &RetrievalFilters,
    ) -> Result<Vec<RetrievedChunk>> {
        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection
        );
        let body = Self::search_body(vector, k, filters);

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("api-key", key);
        }

        let response = req.send().await.context("Failed to send Qdrant search")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Qdrant returned error {}: {}", status, body);
        }

        let parsed: QdrantSearchResponse = response
            .json()
            .await
            .context("Failed to parse Qdrant search response")?;
        Ok(parsed.result.into_iter().filter_map(point_to_chunk).collect())
    }
}
