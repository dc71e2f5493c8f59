//! Storage abstractions for the knowledge base.
//!
//! Two traits split persistence by concern:
//!
//! - [`VectorIndex`] stores chunk vectors with their metadata and answers
//!   nearest-neighbor queries.
//! - [`DocumentRegistry`] tracks every document's identity, content hash,
//!   status, pipeline stage, and chunk records.
//!
//! Each trait has an in-memory backend ([`memory`]) used in tests and for
//! ephemeral runs, and a SQLite backend ([`sqlite`]) that survives restarts.
//! Components receive explicit `Arc<dyn Trait>` handles.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    Chunk, Document, DocumentStatus, IndexFilter, NewDocument, PipelineStage, VectorEntry,
    VectorHit,
};

/// Nearest-neighbor index over chunk vectors.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Insert or replace one entry |
/// | [`delete`](VectorIndex::delete) | Remove one entry by chunk id |
/// | [`delete_by_document`](VectorIndex::delete_by_document) | Remove every entry of a document |
/// | [`replace_document`](VectorIndex::replace_document) | Atomically swap a document's entries |
/// | [`count_for_document`](VectorIndex::count_for_document) | Entries held for a document |
/// | [`query`](VectorIndex::query) | Top-k similarity search with a metadata filter |
///
/// Queries never observe a document with a partially replaced or partially
/// deleted entry set.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, entry: &VectorEntry) -> Result<()>;

    /// Returns `true` if an entry was removed.
    async fn delete(&self, chunk_id: &str) -> Result<bool>;

    /// Returns the number of entries removed.
    async fn delete_by_document(&self, document_id: &str) -> Result<u64>;

    /// Delete every entry of `document_id`, then upsert `entries`, as one
    /// atomic unit.
    async fn replace_document(&self, document_id: &str, entries: &[VectorEntry]) -> Result<()>;

    async fn count_for_document(&self, document_id: &str) -> Result<usize>;

    /// Total number of entries.
    async fn count(&self) -> Result<usize>;

    /// Up to `top_k` entries matching `filter`, scored by cosine similarity
    /// clamped into `[0, 1]` and ordered by [`rank_order`](crate::models::rank_order).
    async fn query(&self, vector: &[f32], top_k: usize, filter: &IndexFilter)
        -> Result<Vec<VectorHit>>;
}

/// Durable record of every known document.
///
/// Documents are keyed by source identity; their id is derived from it with
/// [`document_id_for`](crate::models::document_id_for).
#[async_trait]
pub trait DocumentRegistry: Send + Sync {
    /// Insert or refresh the document for `doc.source`, resetting it to
    /// `processing` at stage `discovered` and clearing any error.
    /// Returns the document id.
    async fn upsert_document(&self, doc: &NewDocument) -> Result<String>;

    /// Replace the chunk records of a document.
    async fn record_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Set status and error detail. Entering `failed` or `deleted` drops the
    /// document's chunk records in the same write.
    async fn mark_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        error: Option<&str>,
    ) -> Result<()>;

    async fn set_stage(&self, document_id: &str, stage: PipelineStage) -> Result<()>;

    async fn get(&self, document_id: &str) -> Result<Option<Document>>;

    async fn get_by_source(&self, source: &str) -> Result<Option<Document>>;

    /// Any live document with this content hash, preferring indexed ones.
    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Document>>;

    /// Documents that are `pending`, `processing`, or `failed`, plus
    /// `indexed` documents last indexed before `since` (Unix ms).
    async fn list_stale(&self, since: i64) -> Result<Vec<Document>>;

    /// Replace chunk records and mark the document `indexed`, in one
    /// transaction. Fails with [`RegistryConflict`](crate::Error::RegistryConflict)
    /// if the stored content hash is no longer `expected_hash`.
    async fn commit_indexed(
        &self,
        document_id: &str,
        expected_hash: &str,
        chunks: &[Chunk],
    ) -> Result<()>;

    /// Chunk records of a document, ordered by index.
    async fn chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;

    /// Count per status, in [`DocumentStatus::ALL`] order.
    async fn status_counts(&self) -> Result<Vec<(DocumentStatus, u64)>>;

    /// Failed documents with their recorded error.
    async fn failures(&self) -> Result<Vec<Document>>;

    async fn list_documents(&self) -> Result<Vec<Document>>;

    /// Documents whose source starts with `prefix`, ordered by source.
    async fn list_by_source_prefix(&self, prefix: &str) -> Result<Vec<Document>>;
}
