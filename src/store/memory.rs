//! In-memory [`VectorIndex`] and [`DocumentRegistry`] implementations.
//!
//! Uses `HashMap` behind `std::sync::RwLock`. Every operation completes
//! under a single lock acquisition, which makes `replace_document` and
//! status transitions atomic with respect to readers. Vector search is
//! brute-force cosine similarity over all stored vectors.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::similarity_score;
use crate::error::{Error, Result};
use crate::models::{
    document_id_for, now_millis, rank_order, Chunk, Document, DocumentStatus, IndexFilter,
    NewDocument, PipelineStage, VectorEntry, VectorHit,
};

use super::{DocumentRegistry, VectorIndex};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// In-memory vector index keyed by chunk id.
#[derive(Default)]
pub struct InMemoryIndex {
    entries: RwLock<HashMap<String, VectorEntry>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, entry: &VectorEntry) -> Result<()> {
        write(&self.entries).insert(entry.chunk_id.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, chunk_id: &str) -> Result<bool> {
        Ok(write(&self.entries).remove(chunk_id).is_some())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<u64> {
        let mut entries = write(&self.entries);
        let before = entries.len();
        entries.retain(|_, e| e.metadata.document_id != document_id);
        Ok((before - entries.len()) as u64)
    }

    async fn replace_document(&self, document_id: &str, new_entries: &[VectorEntry]) -> Result<()> {
        let mut entries = write(&self.entries);
        entries.retain(|_, e| e.metadata.document_id != document_id);
        for entry in new_entries {
            entries.insert(entry.chunk_id.clone(), entry.clone());
        }
        Ok(())
    }

    async fn count_for_document(&self, document_id: &str) -> Result<usize> {
        Ok(read(&self.entries)
            .values()
            .filter(|e| e.metadata.document_id == document_id)
            .count())
    }

    async fn count(&self) -> Result<usize> {
        Ok(read(&self.entries).len())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<VectorHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let entries = read(&self.entries);
        let mut hits: Vec<VectorHit> = entries
            .values()
            .filter(|e| e.vector.len() == vector.len() && filter.matches(&e.metadata))
            .map(|e| VectorHit {
                chunk_id: e.chunk_id.clone(),
                score: similarity_score(vector, &e.vector),
                metadata: e.metadata.clone(),
            })
            .collect();
        hits.sort_by(rank_order);
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[derive(Default)]
struct RegistryState {
    documents: HashMap<String, Document>,
    chunks: HashMap<String, Vec<Chunk>>,
}

/// In-memory document registry.
#[derive(Default)]
pub struct InMemoryRegistry {
    state: RwLock<RegistryState>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(document_id: &str) -> Error {
    Error::Registry(format!("unknown document: {}", document_id))
}

#[async_trait]
impl DocumentRegistry for InMemoryRegistry {
    async fn upsert_document(&self, doc: &NewDocument) -> Result<String> {
        let id = document_id_for(&doc.source);
        let now = now_millis();
        let mut state = write(&self.state);
        let entry = state
            .documents
            .entry(id.clone())
            .or_insert_with(|| Document {
                id: id.clone(),
                source: doc.source.clone(),
                content_hash: String::new(),
                format: String::new(),
                size_bytes: 0,
                status: DocumentStatus::Pending,
                stage: None,
                metadata: Default::default(),
                discovered_at: now,
                last_indexed_at: None,
                updated_at: now,
                error: None,
            });
        entry.content_hash = doc.content_hash.clone();
        entry.format = doc.format.clone();
        entry.size_bytes = doc.size_bytes;
        entry.metadata = doc.metadata.clone();
        entry.status = DocumentStatus::Processing;
        entry.stage = Some(PipelineStage::Discovered);
        entry.error = None;
        entry.updated_at = now;
        Ok(id)
    }

    async fn record_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut state = write(&self.state);
        if !state.documents.contains_key(document_id) {
            return Err(not_found(document_id));
        }
        state
            .chunks
            .insert(document_id.to_string(), chunks.to_vec());
        Ok(())
    }

    async fn mark_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut state = write(&self.state);
        let doc = state
            .documents
            .get_mut(document_id)
            .ok_or_else(|| not_found(document_id))?;
        doc.status = status;
        doc.error = error.map(str::to_string);
        doc.updated_at = now_millis();
        if status == DocumentStatus::Deleted {
            doc.stage = None;
        }
        if matches!(status, DocumentStatus::Failed | DocumentStatus::Deleted) {
            state.chunks.remove(document_id);
        }
        Ok(())
    }

    async fn set_stage(&self, document_id: &str, stage: PipelineStage) -> Result<()> {
        let mut state = write(&self.state);
        let doc = state
            .documents
            .get_mut(document_id)
            .ok_or_else(|| not_found(document_id))?;
        doc.stage = Some(stage);
        doc.updated_at = now_millis();
        Ok(())
    }

    async fn get(&self, document_id: &str) -> Result<Option<Document>> {
        Ok(read(&self.state).documents.get(document_id).cloned())
    }

    async fn get_by_source(&self, source: &str) -> Result<Option<Document>> {
        self.get(&document_id_for(source)).await
    }

    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let state = read(&self.state);
        let mut candidates: Vec<&Document> = state
            .documents
            .values()
            .filter(|d| d.content_hash == content_hash && d.status != DocumentStatus::Deleted)
            .collect();
        candidates.sort_by_key(|d| (d.status != DocumentStatus::Indexed, d.discovered_at));
        Ok(candidates.first().map(|d| (*d).clone()))
    }

    async fn list_stale(&self, since: i64) -> Result<Vec<Document>> {
        let state = read(&self.state);
        let mut stale: Vec<Document> = state
            .documents
            .values()
            .filter(|d| is_stale(d, since))
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.source.cmp(&b.source));
        Ok(stale)
    }

    async fn commit_indexed(
        &self,
        document_id: &str,
        expected_hash: &str,
        chunks: &[Chunk],
    ) -> Result<()> {
        let mut state = write(&self.state);
        let doc = state
            .documents
            .get_mut(document_id)
            .ok_or_else(|| not_found(document_id))?;
        if doc.content_hash != expected_hash {
            return Err(Error::RegistryConflict(document_id.to_string()));
        }
        let now = now_millis();
        doc.status = DocumentStatus::Indexed;
        doc.stage = Some(PipelineStage::Indexed);
        doc.error = None;
        doc.last_indexed_at = Some(now);
        doc.updated_at = now;
        state
            .chunks
            .insert(document_id.to_string(), chunks.to_vec());
        Ok(())
    }

    async fn chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        Ok(read(&self.state)
            .chunks
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn status_counts(&self) -> Result<Vec<(DocumentStatus, u64)>> {
        let state = read(&self.state);
        Ok(DocumentStatus::ALL
            .into_iter()
            .map(|status| {
                let n = state
                    .documents
                    .values()
                    .filter(|d| d.status == status)
                    .count();
                (status, n as u64)
            })
            .collect())
    }

    async fn failures(&self) -> Result<Vec<Document>> {
        let mut failed: Vec<Document> = read(&self.state)
            .documents
            .values()
            .filter(|d| d.status == DocumentStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| a.source.cmp(&b.source));
        Ok(failed)
    }

    async fn list_documents(&self) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = read(&self.state).documents.values().cloned().collect();
        docs.sort_by(|a, b| a.source.cmp(&b.source));
        Ok(docs)
    }

    async fn list_by_source_prefix(&self, prefix: &str) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = read(&self.state)
            .documents
            .values()
            .filter(|d| d.source.starts_with(prefix))
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.source.cmp(&b.source));
        Ok(docs)
    }
}

pub(crate) fn is_stale(doc: &Document, since: i64) -> bool {
    match doc.status {
        DocumentStatus::Pending | DocumentStatus::Processing | DocumentStatus::Failed => true,
        DocumentStatus::Indexed => doc.last_indexed_at.map_or(true, |t| t < since),
        DocumentStatus::Deleted => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, UploadMetadata};

    fn entry(chunk_id: &str, doc: &str, vector: Vec<f32>, ingested_at: i64) -> VectorEntry {
        VectorEntry {
            chunk_id: chunk_id.to_string(),
            vector,
            metadata: ChunkMetadata {
                document_id: doc.to_string(),
                source: format!("{}.md", doc),
                chunk_index: 0,
                text: format!("text of {}", chunk_id),
                category: None,
                tags: Vec::new(),
                ingested_at,
            },
        }
    }

    fn new_doc(source: &str, hash: &str) -> NewDocument {
        NewDocument {
            source: source.to_string(),
            content_hash: hash.to_string(),
            format: "md".to_string(),
            size_bytes: 10,
            metadata: UploadMetadata::default(),
        }
    }

    fn chunk(document_id: &str, index: usize) -> Chunk {
        Chunk {
            id: format!("{}-{}", document_id, index),
            document_id: document_id.to_string(),
            chunk_index: index,
            text: "t".to_string(),
            start_token: index,
            end_token: index + 1,
            start_byte: index,
            end_byte: index + 1,
            overlap_bytes: 0,
            hash: "h".to_string(),
        }
    }

    #[tokio::test]
    async fn query_orders_by_score_then_ingestion() {
        let index = InMemoryIndex::new();
        index.upsert(&entry("late", "a", vec![1.0, 0.0], 20)).await.unwrap();
        index.upsert(&entry("early", "b", vec![2.0, 0.0], 10)).await.unwrap();
        index.upsert(&entry("off", "c", vec![0.6, 0.8], 5)).await.unwrap();
        index.upsert(&entry("opposite", "d", vec![-1.0, 0.0], 1)).await.unwrap();

        let hits = index
            .query(&[1.0, 0.0], 10, &IndexFilter::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late", "off", "opposite"]);
        assert!((hits[2].score - 0.6).abs() < 1e-6);
        assert_eq!(hits[3].score, 0.0);
    }

    #[tokio::test]
    async fn replace_document_swaps_entry_set() {
        let index = InMemoryIndex::new();
        index.upsert(&entry("a0", "a", vec![1.0], 1)).await.unwrap();
        index.upsert(&entry("a1", "a", vec![1.0], 1)).await.unwrap();
        index.upsert(&entry("b0", "b", vec![1.0], 1)).await.unwrap();

        index
            .replace_document("a", &[entry("a2", "a", vec![1.0], 2)])
            .await
            .unwrap();
        assert_eq!(index.count_for_document("a").await.unwrap(), 1);
        assert_eq!(index.count_for_document("b").await.unwrap(), 1);
        assert!(!index.delete("a0").await.unwrap());
        assert_eq!(index.delete_by_document("a").await.unwrap(), 1);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_respects_filter_and_top_k() {
        let index = InMemoryIndex::new();
        index.upsert(&entry("a0", "a", vec![1.0], 1)).await.unwrap();
        index.upsert(&entry("b0", "b", vec![1.0], 1)).await.unwrap();
        let filter = IndexFilter {
            document_id: Some("b".to_string()),
            ..Default::default()
        };
        let hits = index.query(&[1.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "b0");
        assert!(index
            .query(&[1.0], 0, &IndexFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn upsert_resets_to_processing() {
        let registry = InMemoryRegistry::new();
        let id = registry.upsert_document(&new_doc("a.md", "h1")).await.unwrap();
        registry
            .mark_status(&id, DocumentStatus::Failed, Some("extracting: bad"))
            .await
            .unwrap();
        let again = registry.upsert_document(&new_doc("a.md", "h2")).await.unwrap();
        assert_eq!(id, again);
        let doc = registry.get(&id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Processing);
        assert_eq!(doc.content_hash, "h2");
        assert!(doc.error.is_none());
    }

    #[tokio::test]
    async fn commit_rejects_stale_hash() {
        let registry = InMemoryRegistry::new();
        let id = registry.upsert_document(&new_doc("a.md", "h1")).await.unwrap();
        registry.upsert_document(&new_doc("a.md", "h2")).await.unwrap();
        let err = registry
            .commit_indexed(&id, "h1", &[chunk(&id, 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RegistryConflict(_)));

        registry
            .commit_indexed(&id, "h2", &[chunk(&id, 0), chunk(&id, 1)])
            .await
            .unwrap();
        let doc = registry.get(&id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed);
        assert!(doc.last_indexed_at.is_some());
        assert_eq!(registry.chunks(&id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failure_drops_chunk_records() {
        let registry = InMemoryRegistry::new();
        let id = registry.upsert_document(&new_doc("a.md", "h1")).await.unwrap();
        registry.commit_indexed(&id, "h1", &[chunk(&id, 0)]).await.unwrap();
        registry
            .mark_status(&id, DocumentStatus::Failed, Some("embedding: down"))
            .await
            .unwrap();
        assert!(registry.chunks(&id).await.unwrap().is_empty());
        let failures = registry.failures().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error.as_deref(), Some("embedding: down"));
    }

    #[tokio::test]
    async fn stale_listing_and_counts() {
        let registry = InMemoryRegistry::new();
        let a = registry.upsert_document(&new_doc("a.md", "ha")).await.unwrap();
        let b = registry.upsert_document(&new_doc("b.md", "hb")).await.unwrap();
        let c = registry.upsert_document(&new_doc("c.md", "hc")).await.unwrap();
        registry.commit_indexed(&a, "ha", &[]).await.unwrap();
        registry
            .mark_status(&b, DocumentStatus::Failed, Some("x"))
            .await
            .unwrap();
        registry
            .mark_status(&c, DocumentStatus::Deleted, None)
            .await
            .unwrap();

        let stale: Vec<String> = registry
            .list_stale(0)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.source)
            .collect();
        assert_eq!(stale, vec!["b.md".to_string()]);

        let all_stale = registry.list_stale(i64::MAX).await.unwrap();
        assert_eq!(all_stale.len(), 2);

        let counts = registry.status_counts().await.unwrap();
        assert!(counts.contains(&(DocumentStatus::Indexed, 1)));
        assert!(counts.contains(&(DocumentStatus::Failed, 1)));
        assert!(counts.contains(&(DocumentStatus::Deleted, 1)));
        assert!(counts.contains(&(DocumentStatus::Pending, 0)));
    }

    #[tokio::test]
    async fn get_by_hash_prefers_indexed() {
        let registry = InMemoryRegistry::new();
        let a = registry.upsert_document(&new_doc("a.md", "same")).await.unwrap();
        let b = registry.upsert_document(&new_doc("b.md", "same")).await.unwrap();
        registry.commit_indexed(&b, "same", &[]).await.unwrap();
        let found = registry.get_by_hash("same").await.unwrap().unwrap();
        assert_eq!(found.id, b);
        assert_ne!(found.id, a);
        assert!(registry.get_by_hash("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prefix_listing_is_string_prefix() {
        let registry = InMemoryRegistry::new();
        for source in ["/r/sub/a.md", "/r/subway.md", "/r/sub/deep/b.md"] {
            registry.upsert_document(&new_doc(source, source)).await.unwrap();
        }
        let under: Vec<String> = registry
            .list_by_source_prefix("/r/sub/")
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.source)
            .collect();
        assert_eq!(under, vec!["/r/sub/a.md", "/r/sub/deep/b.md"]);
    }
}
