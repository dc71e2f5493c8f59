//! Fakes shared by unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::completion::Completer;
use crate::embedding::{Embedder, EmbedderError, EmbeddingGateway, GatewaySettings};
use crate::error::{Error, Result};
use crate::models::{IndexFilter, VectorEntry, VectorHit};
use crate::store::memory::InMemoryIndex;
use crate::store::VectorIndex;

pub(crate) fn gateway(embedder: Arc<dyn Embedder>) -> EmbeddingGateway {
    EmbeddingGateway::new(
        embedder,
        GatewaySettings {
            batch_size: 16,
            max_retries: 1,
            backoff: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        },
    )
}

/// Maps text to a fixed vector by the first keyword it contains.
pub(crate) struct KeywordEmbedder {
    rules: Vec<(String, Vec<f32>)>,
    fallback: Vec<f32>,
}

impl KeywordEmbedder {
    pub(crate) fn new(rules: &[(&str, Vec<f32>)], fallback: Vec<f32>) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect(),
            fallback,
        }
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword"
    }
    fn dims(&self) -> usize {
        self.fallback.len()
    }
    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedderError> {
        Ok(texts
            .iter()
            .map(|t| {
                let lower = t.to_lowercase();
                self.rules
                    .iter()
                    .find(|(k, _)| lower.contains(k.as_str()))
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(|| self.fallback.clone())
            })
            .collect())
    }
}

/// Unit vector at `cos` similarity to `[1, 0, 0]`.
pub(crate) fn at_similarity(cos: f32) -> Vec<f32> {
    vec![cos, (1.0 - cos * cos).max(0.0).sqrt(), 0.0]
}

/// In-memory index that counts write calls.
#[derive(Default)]
pub(crate) struct CountingIndex {
    inner: InMemoryIndex,
    writes: AtomicUsize,
}

impl CountingIndex {
    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl VectorIndex for CountingIndex {
    async fn upsert(&self, entry: &VectorEntry) -> Result<()> {
        self.bump();
        self.inner.upsert(entry).await
    }
    async fn delete(&self, chunk_id: &str) -> Result<bool> {
        self.bump();
        self.inner.delete(chunk_id).await
    }
    async fn delete_by_document(&self, document_id: &str) -> Result<u64> {
        self.bump();
        self.inner.delete_by_document(document_id).await
    }
    async fn replace_document(&self, document_id: &str, entries: &[VectorEntry]) -> Result<()> {
        self.bump();
        self.inner.replace_document(document_id, entries).await
    }
    async fn count_for_document(&self, document_id: &str) -> Result<usize> {
        self.inner.count_for_document(document_id).await
    }
    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<VectorHit>> {
        self.inner.query(vector, top_k, filter).await
    }
}

/// Embedder whose requests never complete.
pub(crate) struct HangingEmbedder {
    pub(crate) calls: AtomicUsize,
}

impl HangingEmbedder {
    pub(crate) fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Embedder for HangingEmbedder {
    fn model_name(&self) -> &str {
        "hanging"
    }
    fn dims(&self) -> usize {
        3
    }
    async fn embed(&self, _texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// Completer that never answers.
pub(crate) struct HangingCompleter;

#[async_trait]
impl Completer for HangingCompleter {
    fn name(&self) -> &str {
        "hanging"
    }
    async fn complete(&self, _prompt: &str) -> Result<String> {
        std::future::pending().await
    }
}

/// Completer returning a canned answer, or failing when `answer` is `None`.
pub(crate) struct CannedCompleter {
    pub(crate) answer: Option<String>,
    pub(crate) prompts: std::sync::Mutex<Vec<String>>,
}

impl CannedCompleter {
    pub(crate) fn answering(answer: &str) -> Self {
        Self {
            answer: Some(answer.to_string()),
            prompts: Default::default(),
        }
    }

    pub(crate) fn unreachable() -> Self {
        Self {
            answer: None,
            prompts: Default::default(),
        }
    }
}

#[async_trait]
impl Completer for CannedCompleter {
    fn name(&self) -> &str {
        "canned"
    }
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.answer
            .clone()
            .ok_or_else(|| Error::CompletionUnavailable("connection refused".to_string()))
    }
}
