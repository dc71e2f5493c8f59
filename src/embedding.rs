//! Embedding backends and the batching/retry gateway in front of them.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`DisabledEmbedder`]** — rejects every request; used when embeddings are not configured.
//! - **[`HashingEmbedder`]** — deterministic local feature-hashing embedder; no network.
//! - **[`OpenAIEmbedder`]** — calls the OpenAI embeddings API.
//! - **[`OllamaEmbedder`]** — calls a local Ollama instance's `/api/embed` endpoint.
//!
//! Backends make a single attempt per call. The [`EmbeddingGateway`] adds
//! batching, bounded retry with exponential backoff, a per-attempt timeout,
//! and output validation (count and dimension).
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited), 5xx, timeouts, and network errors → transient, retried
//! - HTTP 4xx (not 429) and malformed responses → rejected, not retried
//! - Backoff: `backoff`, `2 × backoff`, `4 × backoff`, ... (capped at 2^5)

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Failure of a single backend call.
#[derive(Debug, Error)]
pub enum EmbedderError {
    /// Worth retrying: rate limits, server errors, connection problems.
    #[error("transient embedding failure: {0}")]
    Transient(String),
    /// Not worth retrying: bad requests, malformed responses, disabled backend.
    #[error("embedding request rejected: {0}")]
    Rejected(String),
}

/// A black-box `embed(texts) -> vectors` backend.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed `texts` in one backend call, returning one vector per input.
    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedderError>;
}

// ============ Disabled ============

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedderError> {
        Err(EmbedderError::Rejected(
            "Embedding provider is disabled".to_string(),
        ))
    }
}

// ============ Hashing ============

/// Bag-of-words feature-hashing embedder.
///
/// Lowercased alphanumeric terms are hashed into `dims` signed buckets and
/// the result is L2-normalized, so texts sharing vocabulary have positive
/// cosine similarity. Deterministic and offline.
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for term in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(term.to_lowercase().as_bytes());
            let mut word = [0u8; 8];
            word.copy_from_slice(&digest[..8]);
            let h = u64::from_le_bytes(word);
            let bucket = (h % self.dims as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedderError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ HTTP helpers ============

fn classify_send_error(e: reqwest::Error) -> EmbedderError {
    EmbedderError::Transient(e.to_string())
}

async fn classify_status(response: reqwest::Response, backend: &str) -> EmbedderError {
    let status = response.status();
    let body_text = response.text().await.unwrap_or_default();
    let msg = format!("{} API error {}: {}", backend, status, body_text);
    if status.as_u16() == 429 || status.is_server_error() {
        EmbedderError::Transient(msg)
    } else {
        EmbedderError::Rejected(msg)
    }
}

fn parse_vector(value: &serde_json::Value) -> Option<Vec<f32>> {
    value
        .as_array()
        .map(|arr| arr.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

// ============ OpenAI ============

/// Embedding backend using `POST https://api.openai.com/v1/embeddings`.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    api_key: String,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model,
            dims,
            api_key,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedderError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(classify_send_error)?;
        if !response.status().is_success() {
            return Err(classify_status(response, "OpenAI").await);
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbedderError::Transient(e.to_string()))?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(
    json: &serde_json::Value,
) -> std::result::Result<Vec<Vec<f32>>, EmbedderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbedderError::Rejected("Invalid OpenAI response: missing data array".to_string()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let vec = item
            .get("embedding")
            .and_then(parse_vector)
            .ok_or_else(|| EmbedderError::Rejected("Invalid OpenAI response: missing embedding".to_string()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Embedding backend using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default: `http://localhost:11434`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model,
            dims,
            url,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedderError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                EmbedderError::Transient(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;
        if !response.status().is_success() {
            return Err(classify_status(response, "Ollama").await);
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbedderError::Transient(e.to_string()))?;
        json.get("embeddings")
            .and_then(|e| e.as_array())
            .map(|arr| arr.iter().filter_map(parse_vector).collect())
            .ok_or_else(|| {
                EmbedderError::Rejected("Invalid Ollama response: missing embeddings".to_string())
            })
    }
}

/// Create the [`Embedder`] named by `config.provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dims.unwrap_or(256)))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Gateway ============

/// Batching and retry policy for the [`EmbeddingGateway`].
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub batch_size: usize,
    pub max_retries: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl From<&EmbeddingConfig> for GatewaySettings {
    fn from(config: &EmbeddingConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// Wraps an [`Embedder`] with batching, bounded retry, and validation.
pub struct EmbeddingGateway {
    embedder: Arc<dyn Embedder>,
    settings: GatewaySettings,
}

impl EmbeddingGateway {
    pub fn new(embedder: Arc<dyn Embedder>, settings: GatewaySettings) -> Self {
        let settings = GatewaySettings {
            batch_size: settings.batch_size.max(1),
            ..settings
        };
        Self { embedder, settings }
    }

    pub fn from_config(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        Ok(Self::new(create_embedder(config)?, GatewaySettings::from(config)))
    }

    pub fn dims(&self) -> usize {
        self.embedder.dims()
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    /// Embed `texts`, returning exactly one vector of [`dims`](Self::dims)
    /// per input, in input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let expected_dims = self.dims();
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.settings.batch_size) {
            let vectors = self.embed_with_retry(batch).await?;
            if vectors.len() != batch.len() {
                return Err(Error::EmbeddingRejected(format!(
                    "backend returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            if let Some(bad) = vectors.iter().find(|v| v.len() != expected_dims) {
                return Err(Error::DimensionMismatch {
                    expected: expected_dims,
                    actual: bad.len(),
                });
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    /// Embed a single query string.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::EmbeddingRejected("Empty embedding response".to_string()))
    }

    async fn embed_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let attempts = self.settings.max_retries + 1;
        let mut last_cause = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.settings.backoff * (1u32 << (attempt - 1).min(5));
                debug!(attempt, ?delay, "retrying embedding batch");
                tokio::time::sleep(delay).await;
            }

            match tokio::time::timeout(self.settings.timeout, self.embedder.embed(batch)).await {
                Ok(Ok(vectors)) => return Ok(vectors),
                Ok(Err(EmbedderError::Rejected(msg))) => return Err(Error::EmbeddingRejected(msg)),
                Ok(Err(EmbedderError::Transient(msg))) => {
                    warn!(attempt, error = %msg, "embedding batch failed");
                    last_cause = msg;
                }
                Err(_) => {
                    warn!(attempt, "embedding batch timed out");
                    last_cause = format!("timed out after {:?}", self.settings.timeout);
                }
            }
        }

        Err(Error::EmbeddingUnavailable {
            attempts,
            cause: last_cause,
        })
    }
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty, zero, or
/// mismatched-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Map cosine similarity onto the `[0, 1]` score scale used by the index.
/// Anti-correlated vectors score 0.
pub fn similarity_score(a: &[f32], b: &[f32]) -> f32 {
    cosine_similarity(a, b).clamp(0.0, 1.0)
}
