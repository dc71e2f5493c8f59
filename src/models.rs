//! Core data models used throughout the knowledge base.
//!
//! These types represent the documents, chunks, index entries, and search
//! hits that flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Namespace for document and chunk UUIDv5 identifiers.
const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6b62_6861_726e_6573_735f_6964_735f_7631);

/// Ingestion status of a document as recorded in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Indexed,
    Failed,
    Deleted,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 5] = [
        DocumentStatus::Pending,
        DocumentStatus::Processing,
        DocumentStatus::Indexed,
        DocumentStatus::Failed,
        DocumentStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Failed => "failed",
            DocumentStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown document status: {}", s))
    }
}

/// Stage of the per-document ingestion state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Discovered,
    Extracting,
    Chunking,
    Embedding,
    Indexing,
    Indexed,
}

impl PipelineStage {
    const ALL: [PipelineStage; 6] = [
        PipelineStage::Discovered,
        PipelineStage::Extracting,
        PipelineStage::Chunking,
        PipelineStage::Embedding,
        PipelineStage::Indexing,
        PipelineStage::Indexed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Discovered => "discovered",
            PipelineStage::Extracting => "extracting",
            PipelineStage::Chunking => "chunking",
            PipelineStage::Embedding => "embedding",
            PipelineStage::Indexing => "indexing",
            PipelineStage::Indexed => "indexed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PipelineStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown pipeline stage: {}", s))
    }
}

/// Metadata supplied at upload time and propagated to every chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A document known to the registry.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    /// Source identity: a filesystem path or `upload://<name>`.
    pub source: String,
    pub content_hash: String,
    /// Format tag or hint as supplied at ingestion time.
    pub format: String,
    pub size_bytes: u64,
    pub status: DocumentStatus,
    pub stage: Option<PipelineStage>,
    pub metadata: UploadMetadata,
    /// Unix milliseconds.
    pub discovered_at: i64,
    pub last_indexed_at: Option<i64>,
    pub updated_at: i64,
    pub error: Option<String>,
}

/// Input to [`DocumentRegistry::upsert_document`](crate::store::DocumentRegistry::upsert_document).
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub source: String,
    pub content_hash: String,
    pub format: String,
    pub size_bytes: u64,
    pub metadata: UploadMetadata,
}

/// A chunk of a document's normalized text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub text: String,
    /// Token span `[start_token, end_token)`.
    pub start_token: usize,
    pub end_token: usize,
    /// Byte span in the normalized text.
    pub start_byte: usize,
    pub end_byte: usize,
    /// Bytes shared with the predecessor chunk (0 for the first chunk).
    pub overlap_bytes: usize,
    /// SHA-256 of `text`.
    pub hash: String,
}

impl Chunk {
    pub fn token_count(&self) -> usize {
        self.end_token - self.start_token
    }
}

/// Metadata stored alongside each vector in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub source: String,
    pub chunk_index: usize,
    pub text: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    /// Unix milliseconds when the owning document was ingested.
    pub ingested_at: i64,
}

/// A vector plus metadata, keyed by chunk id.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A nearest-neighbor result from the vector index.
#[derive(Debug, Clone, Serialize)]
pub struct VectorHit {
    pub chunk_id: String,
    /// Similarity in `[0, 1]`, higher is more similar.
    pub score: f32,
    pub metadata: ChunkMetadata,
}

/// Metadata filter applied to vector index queries.
#[derive(Debug, Clone, Default)]
pub struct IndexFilter {
    pub document_id: Option<String>,
    /// Skip chunks of this document.
    pub exclude_document: Option<String>,
    pub source: Option<String>,
    pub category: Option<String>,
    pub tag: Option<String>,
}

impl IndexFilter {
    pub fn matches(&self, meta: &ChunkMetadata) -> bool {
        if let Some(ref id) = self.document_id {
            if &meta.document_id != id {
                return false;
            }
        }
        if self.exclude_document.as_ref() == Some(&meta.document_id) {
            return false;
        }
        if let Some(ref source) = self.source {
            if &meta.source != source {
                return false;
            }
        }
        if let Some(ref category) = self.category {
            if meta.category.as_ref() != Some(category) {
                return false;
            }
        }
        if let Some(ref tag) = self.tag {
            if !meta.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        true
    }
}

/// Result ordering: score desc, then earliest ingestion, then chunk id.
pub fn rank_order(a: &VectorHit, b: &VectorHit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(a.metadata.ingested_at.cmp(&b.metadata.ingested_at))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// A search result returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub source: String,
    pub chunk_index: usize,
    pub score: f32,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub ingested_at: i64,
}

impl From<VectorHit> for SearchHit {
    fn from(hit: VectorHit) -> Self {
        let meta = hit.metadata;
        SearchHit {
            chunk_id: hit.chunk_id,
            document_id: meta.document_id,
            source: meta.source,
            chunk_index: meta.chunk_index,
            score: hit.score,
            text: meta.text,
            category: meta.category,
            tags: meta.tags,
            ingested_at: meta.ingested_at,
        }
    }
}

/// Hex SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Stable document id for a source identity.
pub fn document_id_for(source: &str) -> String {
    Uuid::new_v5(&ID_NAMESPACE, source.as_bytes()).to_string()
}

/// Deterministic chunk id: identical document, position, and content give
/// the identical id across runs.
pub fn chunk_id_for(document_id: &str, chunk_index: usize, content_hash: &str) -> String {
    let name = format!("{}:{}:{}", document_id, chunk_index, content_hash);
    Uuid::new_v5(&ID_NAMESPACE, name.as_bytes()).to_string()
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f32, ingested_at: i64) -> VectorHit {
        VectorHit {
            chunk_id: id.to_string(),
            score,
            metadata: ChunkMetadata {
                document_id: "d".to_string(),
                source: "s".to_string(),
                chunk_index: 0,
                text: String::new(),
                category: None,
                tags: Vec::new(),
                ingested_at,
            },
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in DocumentStatus::ALL {
            assert_eq!(status.as_str().parse::<DocumentStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn ids_are_deterministic() {
        assert_eq!(document_id_for("docs/a.md"), document_id_for("docs/a.md"));
        assert_ne!(document_id_for("docs/a.md"), document_id_for("docs/b.md"));
        let doc = document_id_for("docs/a.md");
        assert_eq!(chunk_id_for(&doc, 0, "h"), chunk_id_for(&doc, 0, "h"));
        assert_ne!(chunk_id_for(&doc, 0, "h"), chunk_id_for(&doc, 1, "h"));
        assert_ne!(chunk_id_for(&doc, 0, "h"), chunk_id_for(&doc, 0, "g"));
    }

    #[test]
    fn rank_order_breaks_ties_by_ingestion_time() {
        let mut hits = vec![hit("c", 0.5, 30), hit("b", 0.9, 20), hit("a", 0.5, 10)];
        hits.sort_by(rank_order);
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn filter_matches_category_and_tag() {
        let mut meta = hit("x", 1.0, 0).metadata;
        meta.category = Some("guides".to_string());
        meta.tags = vec!["auth".to_string()];

        let filter = IndexFilter {
            category: Some("guides".to_string()),
            tag: Some("auth".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&meta));

        let other = IndexFilter {
            tag: Some("billing".to_string()),
            ..Default::default()
        };
        assert!(!other.matches(&meta));

        let excluding = IndexFilter {
            exclude_document: Some(meta.document_id.clone()),
            ..Default::default()
        };
        assert!(!excluding.matches(&meta));
    }
}
