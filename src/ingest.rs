//! Ingestion pipeline orchestration.
//!
//! Drives one document through `discovered → extracting → chunking →
//! embedding → indexing → indexed`, recording each stage in the registry.
//! Any failure rolls back the document's index entries and records
//! `failed` with `"<stage>: <cause>"`; it never propagates to sibling
//! ingestions.
//!
//! Work on one document is serialized through a keyed lock table; work
//! across documents is bounded by a semaphore (`ingest.max_in_flight`).
//! Unchanged content (same hash, already `indexed`) is skipped without
//! touching the index.

use anyhow::Context;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::app::App;
use crate::chunk::chunk_document;
use crate::config::{ChunkingConfig, IngestConfig};
use crate::embedding::EmbeddingGateway;
use crate::error::{Error, Result};
use crate::extract::{Extractor, Format};
use crate::models::{
    document_id_for, now_millis, sha256_hex, ChunkMetadata, DocumentStatus, NewDocument,
    PipelineStage, UploadMetadata, VectorEntry,
};
use crate::store::{DocumentRegistry, VectorIndex};

/// Raw bytes to ingest under a source identity.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub source: String,
    pub bytes: Vec<u8>,
    /// MIME type, format tag, or file name.
    pub format_hint: String,
    pub metadata: UploadMetadata,
}

/// Result of ingesting one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum IngestOutcome {
    Indexed {
        document_id: String,
        chunks: usize,
    },
    /// Same content already indexed; nothing was written.
    Unchanged { document_id: String },
    /// Upload whose content is already indexed under another source.
    Duplicate { document_id: String, source: String },
    Failed {
        document_id: Option<String>,
        error: String,
    },
}

impl IngestOutcome {
    pub fn document_id(&self) -> Option<&str> {
        match self {
            IngestOutcome::Indexed { document_id, .. }
            | IngestOutcome::Unchanged { document_id }
            | IngestOutcome::Duplicate { document_id, .. } => Some(document_id),
            IngestOutcome::Failed { document_id, .. } => document_id.as_deref(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, IngestOutcome::Failed { .. })
    }
}

/// Source identity for a filesystem path.
pub fn source_for_path(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

/// Per-key async mutexes. Entries nobody holds or awaits are pruned on
/// the next acquisition.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    table: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub(crate) async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.retain(|_, m| Arc::strong_count(m) > 1);
            table.entry(key.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }
}

struct Slot {
    _guard: OwnedMutexGuard<()>,
    _permit: OwnedSemaphorePermit,
}

/// A failure attributed to the stage it happened in.
struct StageError {
    stage: PipelineStage,
    error: Error,
}

fn at(stage: PipelineStage) -> impl Fn(Error) -> StageError {
    move |error| StageError { stage, error }
}

/// Extract → chunk → embed → index, with registry bookkeeping.
///
/// Cheap to clone; clones share stores, locks, and the concurrency limit.
#[derive(Clone)]
pub struct IngestPipeline {
    registry: Arc<dyn DocumentRegistry>,
    index: Arc<dyn VectorIndex>,
    gateway: Arc<EmbeddingGateway>,
    extractor: Extractor,
    chunking: ChunkingConfig,
    permits: Arc<Semaphore>,
    locks: Arc<KeyedLocks>,
}

impl IngestPipeline {
    pub fn new(
        registry: Arc<dyn DocumentRegistry>,
        index: Arc<dyn VectorIndex>,
        gateway: Arc<EmbeddingGateway>,
        chunking: &ChunkingConfig,
        ingest: &IngestConfig,
    ) -> Result<Self> {
        if chunking.size_tokens == 0 || chunking.overlap_tokens >= chunking.size_tokens {
            return Err(Error::InvalidConfig(format!(
                "chunk overlap ({}) must be smaller than a non-zero chunk size ({})",
                chunking.overlap_tokens, chunking.size_tokens
            )));
        }
        Ok(Self {
            registry,
            index,
            gateway,
            extractor: Extractor::new(ingest.max_file_bytes),
            chunking: chunking.clone(),
            permits: Arc::new(Semaphore::new(ingest.max_in_flight.max(1))),
            locks: Arc::new(KeyedLocks::default()),
        })
    }

    pub fn registry(&self) -> &Arc<dyn DocumentRegistry> {
        &self.registry
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn gateway(&self) -> &Arc<EmbeddingGateway> {
        &self.gateway
    }

    async fn slot(&self, document_id: &str) -> Result<Slot> {
        // Lock first so queued work on one document holds no permit.
        let guard = self.locks.lock(document_id).await;
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        Ok(Slot {
            _guard: guard,
            _permit: permit,
        })
    }

    /// Ingest raw bytes under `request.source`.
    pub async fn ingest(&self, request: IngestRequest) -> IngestOutcome {
        let document_id = document_id_for(&request.source);
        let _slot = match self.slot(&document_id).await {
            Ok(slot) => slot,
            Err(e) => return failed(Some(document_id), PipelineStage::Discovered, &e),
        };
        self.process(request, false).await
    }

    /// Read and ingest a file. The size ceiling is checked from file
    /// metadata before any bytes are read.
    pub async fn ingest_file(&self, path: &Path, metadata: UploadMetadata) -> IngestOutcome {
        self.ingest_path(path, metadata, false).await
    }

    /// Like [`ingest_file`](Self::ingest_file), but re-runs every stage even
    /// when the content is unchanged.
    pub async fn reingest_file(&self, path: &Path, metadata: UploadMetadata) -> IngestOutcome {
        self.ingest_path(path, metadata, true).await
    }

    async fn ingest_path(&self, path: &Path, metadata: UploadMetadata, force: bool) -> IngestOutcome {
        let source = source_for_path(path);
        let document_id = document_id_for(&source);
        let _slot = match self.slot(&document_id).await {
            Ok(slot) => slot,
            Err(e) => return failed(Some(document_id), PipelineStage::Discovered, &e),
        };

        let size = match tokio::fs::metadata(path).await {
            Ok(m) => m.len(),
            Err(e) => return failed(None, PipelineStage::Discovered, &Error::Io(e)),
        };
        if let Err(e) = self.extractor.check_size(size) {
            let doc = NewDocument {
                source,
                content_hash: String::new(),
                format: format_label(&path.to_string_lossy()),
                size_bytes: size,
                metadata,
            };
            return self.reject_unread(doc, e).await;
        }

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => return failed(None, PipelineStage::Discovered, &Error::Io(e)),
        };
        self.process(
            IngestRequest {
                source,
                bytes,
                format_hint: path.to_string_lossy().into_owned(),
                metadata,
            },
            force,
        )
        .await
    }

    /// Ingest an uploaded file under `upload://<filename>`.
    ///
    /// Content already indexed under another source is reported as a
    /// duplicate instead of being indexed twice.
    pub async fn ingest_upload(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        format_hint: Option<&str>,
        metadata: UploadMetadata,
    ) -> IngestOutcome {
        let source = format!("upload://{}", filename);
        let hash = sha256_hex(&bytes);
        match self.registry.get_by_hash(&hash).await {
            Ok(Some(existing))
                if existing.status == DocumentStatus::Indexed && existing.source != source =>
            {
                info!(source = %source, duplicate_of = %existing.source, "skipping duplicate upload");
                return IngestOutcome::Duplicate {
                    document_id: existing.id,
                    source: existing.source,
                };
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "duplicate lookup failed; ingesting anyway"),
        }
        self.ingest(IngestRequest {
            source,
            bytes,
            format_hint: format_hint.unwrap_or(filename).to_string(),
            metadata,
        })
        .await
    }

    /// Ingest many documents concurrently. Outcomes are returned in input
    /// order; one item's failure does not affect the others.
    pub async fn ingest_batch(&self, requests: Vec<IngestRequest>) -> Vec<IngestOutcome> {
        let total = requests.len();
        let mut set = JoinSet::new();
        for (position, request) in requests.into_iter().enumerate() {
            let pipeline = self.clone();
            set.spawn(async move { (position, pipeline.ingest(request).await) });
        }

        let mut outcomes: Vec<Option<IngestOutcome>> = vec![None; total];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((position, outcome)) => outcomes[position] = Some(outcome),
                Err(e) => error!(error = %e, "ingestion task panicked"),
            }
        }
        outcomes
            .into_iter()
            .map(|o| {
                o.unwrap_or_else(|| IngestOutcome::Failed {
                    document_id: None,
                    error: "ingestion task aborted".to_string(),
                })
            })
            .collect()
    }

    /// Tombstone the document for `source` and drop its index entries.
    /// Returns `false` when there was no live document.
    pub async fn remove(&self, source: &str) -> Result<bool> {
        let document_id = document_id_for(source);
        let _slot = self.slot(&document_id).await?;

        match self.registry.get(&document_id).await? {
            Some(doc) if doc.status != DocumentStatus::Deleted => {}
            _ => return Ok(false),
        }
        let removed = self.index.delete_by_document(&document_id).await?;
        self.registry
            .mark_status(
                &document_id,
                DocumentStatus::Deleted,
                Some(&format!("Source file deleted: {}", source)),
            )
            .await?;
        info!(document_id = %document_id, source, chunks = removed, "removed document");
        Ok(true)
    }

    async fn process(&self, request: IngestRequest, force: bool) -> IngestOutcome {
        let document_id = document_id_for(&request.source);
        let hash = sha256_hex(&request.bytes);

        match self.registry.get(&document_id).await {
            Ok(Some(doc))
                if !force && doc.status == DocumentStatus::Indexed && doc.content_hash == hash =>
            {
                debug!(document_id = %document_id, source = %request.source, "content unchanged");
                return IngestOutcome::Unchanged { document_id };
            }
            Ok(_) => {}
            Err(e) => return failed(Some(document_id), PipelineStage::Discovered, &e),
        }

        let doc = NewDocument {
            source: request.source.clone(),
            content_hash: hash.clone(),
            format: format_label(&request.format_hint),
            size_bytes: request.bytes.len() as u64,
            metadata: request.metadata.clone(),
        };
        let document_id = match self.registry.upsert_document(&doc).await {
            Ok(id) => id,
            Err(e) => return failed(Some(document_id), PipelineStage::Discovered, &e),
        };

        match self.run_stages(&document_id, &hash, request).await {
            Ok(chunks) => {
                info!(document_id = %document_id, source = %doc.source, chunks, "indexed document");
                IngestOutcome::Indexed {
                    document_id,
                    chunks,
                }
            }
            Err(e) => self.fail(&document_id, e).await,
        }
    }

    async fn enter(&self, document_id: &str, stage: PipelineStage) -> std::result::Result<(), StageError> {
        debug!(document_id, %stage, "entering stage");
        self.registry
            .set_stage(document_id, stage)
            .await
            .map_err(at(stage))
    }

    async fn run_stages(
        &self,
        document_id: &str,
        hash: &str,
        request: IngestRequest,
    ) -> std::result::Result<usize, StageError> {
        use PipelineStage::*;

        self.enter(document_id, Extracting).await?;
        let format = Format::resolve(&request.format_hint).map_err(at(Extracting))?;
        let extractor = self.extractor.clone();
        let bytes = request.bytes;
        let text = tokio::task::spawn_blocking(move || extractor.extract(&bytes, format))
            .await
            .map_err(|e| Error::CorruptInput(format!("extraction task failed: {}", e)))
            .and_then(|r| r)
            .map_err(at(Extracting))?;

        self.enter(document_id, Chunking).await?;
        let chunks = chunk_document(
            document_id,
            &text,
            self.chunking.size_tokens,
            self.chunking.overlap_tokens,
        )
        .map_err(at(Chunking))?;
        self.registry
            .record_chunks(document_id, &chunks)
            .await
            .map_err(at(Chunking))?;

        self.enter(document_id, Embedding).await?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self
            .gateway
            .embed_batch(&texts)
            .await
            .map_err(at(Embedding))?;

        self.enter(document_id, Indexing).await?;
        let ingested_at = now_millis();
        let entries: Vec<VectorEntry> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorEntry {
                chunk_id: chunk.id.clone(),
                vector,
                metadata: ChunkMetadata {
                    document_id: document_id.to_string(),
                    source: request.source.clone(),
                    chunk_index: chunk.chunk_index,
                    text: chunk.text.clone(),
                    category: request.metadata.category.clone(),
                    tags: request.metadata.tags.clone(),
                    ingested_at,
                },
            })
            .collect();
        self.index
            .replace_document(document_id, &entries)
            .await
            .map_err(at(Indexing))?;

        let stored = self
            .index
            .count_for_document(document_id)
            .await
            .map_err(at(Indexing))?;
        if stored != chunks.len() {
            return Err(at(Indexing)(Error::Consistency(format!(
                "index holds {} chunks for document {}, expected {}",
                stored,
                document_id,
                chunks.len()
            ))));
        }

        self.registry
            .commit_indexed(document_id, hash, &chunks)
            .await
            .map_err(at(Indexing))?;
        Ok(chunks.len())
    }

    async fn fail(&self, document_id: &str, failure: StageError) -> IngestOutcome {
        let message = format!("{}: {}", failure.stage, failure.error);
        warn!(document_id, stage = %failure.stage, error = %failure.error, "ingestion failed");

        if let Err(e) = self.index.delete_by_document(document_id).await {
            error!(document_id, error = %e, "rollback of index entries failed");
        }
        if let Err(e) = self
            .registry
            .mark_status(document_id, DocumentStatus::Failed, Some(&message))
            .await
        {
            error!(document_id, error = %e, "failed to record failure");
        }

        IngestOutcome::Failed {
            document_id: Some(document_id.to_string()),
            error: message,
        }
    }

    /// Register a document that was rejected before its bytes were read.
    async fn reject_unread(&self, doc: NewDocument, error: Error) -> IngestOutcome {
        match self.registry.upsert_document(&doc).await {
            Ok(id) => {
                self.fail(
                    &id,
                    StageError {
                        stage: PipelineStage::Extracting,
                        error,
                    },
                )
                .await
            }
            Err(e) => failed(None, PipelineStage::Discovered, &e),
        }
    }
}

fn format_label(hint: &str) -> String {
    Format::resolve(hint)
        .map(|f| f.tag().to_string())
        .unwrap_or_else(|_| hint.to_string())
}

fn failed(document_id: Option<String>, stage: PipelineStage, error: &Error) -> IngestOutcome {
    warn!(document_id = ?document_id, %stage, error = %error, "ingestion failed");
    IngestOutcome::Failed {
        document_id,
        error: format!("{}: {}", stage, error),
    }
}

// ============ CLI ============

/// CLI entry point for `kb ingest`. Files are ingested concurrently;
/// directories are left to `kb scan`.
pub async fn run_ingest(app: &App, paths: &[PathBuf], metadata: UploadMetadata) -> anyhow::Result<()> {
    let mut set = JoinSet::new();
    for (position, path) in paths.iter().enumerate() {
        if path.is_dir() {
            println!("skip {} (directory; use `kb scan`)", path.display());
            continue;
        }
        let pipeline = app.pipeline.clone();
        let path = path.clone();
        let metadata = metadata.clone();
        set.spawn(async move {
            let outcome = pipeline.ingest_file(&path, metadata).await;
            (position, path, outcome)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        results.push(joined.context("ingestion task panicked")?);
    }
    results.sort_by_key(|(position, _, _)| *position);

    let mut failures = 0;
    for (_, path, outcome) in &results {
        match outcome {
            IngestOutcome::Indexed { chunks, .. } => {
                println!("indexed   {} ({} chunks)", path.display(), chunks)
            }
            IngestOutcome::Unchanged { .. } => println!("unchanged {}", path.display()),
            IngestOutcome::Duplicate { source, .. } => {
                println!("duplicate {} (of {})", path.display(), source)
            }
            IngestOutcome::Failed { error, .. } => {
                failures += 1;
                println!("failed    {}: {}", path.display(), error)
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} file(s) failed to ingest", failures, results.len());
    }
    Ok(())
}

/// CLI entry point for `kb remove`.
pub async fn run_remove(app: &App, path: &Path) -> anyhow::Result<()> {
    let source = source_for_path(path);
    if app.pipeline.remove(&source).await? {
        println!("removed {}", source);
    } else {
        println!("not indexed: {}", source);
    }
    Ok(())
}
