//! Incremental indexing driven by file-change events.
//!
//! The [`IncrementalIndexer`] keeps the index in step with a directory tree:
//!
//! 1. Events arrive on a channel (from the watcher or a scan).
//! 2. Events for one path are debounced; the latest event in the window wins.
//! 3. Work on one path never overlaps. An event arriving while that path is
//!    being processed waits and is dispatched as soon as the current run
//!    finishes.
//! 4. Additions and modifications re-ingest the file (skipped when the
//!    content hash is unchanged); removals tombstone the document.
//! 5. Watchers report a moved or deleted directory by the directory path
//!    alone, so removals tombstone every document under that path, and a
//!    directory that appears is walked for matching files.
//!
//! # Path Filtering
//!
//! Paths are matched relative to the watched root against
//! `watch.include_globs` and `watch.exclude_globs`. Version-control and
//! build directories are always excluded:
//!
//! ```text
//! **/.git/**
//! **/target/**
//! **/node_modules/**
//! ```

use anyhow::Context;
use chrono::NaiveDate;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::app::App;
use crate::config::WatchConfig;
use crate::error::{Error, Result};
use crate::ingest::{source_for_path, IngestOutcome, IngestPipeline};
use crate::models::{now_millis, DocumentStatus, UploadMetadata};

const DEFAULT_EXCLUDES: [&str; 3] = ["**/.git/**", "**/target/**", "**/node_modules/**"];

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl FileEvent {
    pub fn new(path: impl Into<PathBuf>, kind: FileEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
            timestamp: now_millis(),
        }
    }
}

// ============ Filtering ============

/// Include/exclude glob matching relative to a root directory.
#[derive(Debug, Clone)]
pub struct PathFilter {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl PathFilter {
    pub fn new(root: &Path, config: &WatchConfig) -> Result<Self> {
        let mut excludes = config.exclude_globs.clone();
        excludes.extend(DEFAULT_EXCLUDES.iter().map(|s| s.to_string()));
        Ok(Self {
            root: root.to_path_buf(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
        })
    }

    /// `true` if `path` lies under the root and passes the globs.
    pub fn accepts(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        let rel_str = relative.to_string_lossy();
        !self.exclude.is_match(rel_str.as_ref()) && self.include.is_match(rel_str.as_ref())
    }

    /// `true` if `path` lies strictly under the root and no exclude glob
    /// matches it. Used for directories and vanished paths, which the
    /// include globs (naming files) would reject.
    pub fn covers(&self, path: &Path) -> bool {
        match path.strip_prefix(&self.root) {
            Ok(relative) if !relative.as_os_str().is_empty() => {
                !self.exclude.is_match(relative.to_string_lossy().as_ref())
            }
            _ => false,
        }
    }

    fn admits(&self, path: &Path) -> bool {
        self.accepts(path) || (!path.is_file() && self.covers(path))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::InvalidConfig(format!("bad glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::InvalidConfig(e.to_string()))
}

// ============ Indexer ============

/// Tallies of a scan or retry pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub indexed: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub failed: usize,
    /// Documents that could not be revisited (uploads have no file to re-read).
    pub skipped: usize,
}

impl PassReport {
    fn record(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Indexed { .. } => self.indexed += 1,
            IngestOutcome::Unchanged { .. } | IngestOutcome::Duplicate { .. } => {
                self.unchanged += 1
            }
            IngestOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub source: String,
    pub error: String,
}

/// Snapshot of indexing state.
#[derive(Debug, Clone, Serialize)]
pub struct IndexerStatus {
    pub counts: Vec<(DocumentStatus, u64)>,
    pub indexed_chunks: usize,
    /// Events waiting for their debounce window or for an in-flight run.
    pub queued: usize,
    pub in_flight: usize,
    pub failures: Vec<FailureReport>,
    pub last_scan_at: Option<i64>,
}

#[derive(Debug, Default)]
struct Activity {
    queued: usize,
    in_flight: usize,
    last_scan_at: Option<i64>,
}

/// Applies file events under one root through an [`IngestPipeline`].
#[derive(Clone)]
pub struct IncrementalIndexer {
    pipeline: IngestPipeline,
    root: PathBuf,
    filter: PathFilter,
    debounce: Duration,
    activity: Arc<Mutex<Activity>>,
}

impl IncrementalIndexer {
    /// `root` must exist; it is canonicalized so event paths and scan paths
    /// map to the same source identities.
    pub fn new(pipeline: IngestPipeline, root: &Path, config: &WatchConfig) -> Result<Self> {
        let root = std::fs::canonicalize(root)?;
        let filter = PathFilter::new(&root, config)?;
        Ok(Self {
            pipeline,
            root,
            filter,
            debounce: Duration::from_millis(config.debounce_ms),
            activity: Arc::new(Mutex::new(Activity::default())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn activity(&self) -> std::sync::MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Consume events until the channel closes and all accepted events have
    /// been applied.
    pub async fn run(&self, mut rx: mpsc::Receiver<FileEvent>) {
        let mut pending: HashMap<PathBuf, (FileEvent, Instant)> = HashMap::new();
        let mut in_flight: HashSet<PathBuf> = HashSet::new();
        let mut tasks: JoinSet<PathBuf> = JoinSet::new();
        let mut open = true;

        loop {
            let now = Instant::now();
            let ready: Vec<PathBuf> = pending
                .iter()
                .filter(|(path, (_, due))| *due <= now && !in_flight.contains(*path))
                .map(|(path, _)| path.clone())
                .collect();
            for path in ready {
                let Some((event, _)) = pending.remove(&path) else {
                    continue;
                };
                in_flight.insert(path.clone());
                let pipeline = self.pipeline.clone();
                let filter = self.filter.clone();
                tasks.spawn(async move {
                    // A panic in the handler must not lose track of the path.
                    if let Err(e) = tokio::spawn(handle_event(pipeline, filter, event)).await {
                        error!(path = %path.display(), error = %e, "event handler panicked");
                    }
                    path
                });
            }

            {
                let mut activity = self.activity();
                activity.queued = pending.len();
                activity.in_flight = in_flight.len();
            }

            if !open && pending.is_empty() && tasks.is_empty() {
                break;
            }

            let next_due = pending
                .iter()
                .filter(|(path, _)| !in_flight.contains(*path))
                .map(|(_, (_, due))| *due)
                .min();
            let wake = async move {
                match next_due {
                    Some(due) => tokio::time::sleep_until(due).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                received = rx.recv(), if open => match received {
                    Some(event) => {
                        if self.filter.admits(&event.path) {
                            debug!(path = %event.path.display(), kind = ?event.kind, "queued event");
                            let due = Instant::now() + self.debounce;
                            pending.insert(event.path.clone(), (event, due));
                        }
                    }
                    None => open = false,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Ok(path) => {
                        in_flight.remove(&path);
                    }
                    Err(e) => error!(error = %e, "event task failed"),
                },
                _ = wake => {}
            }
        }
        debug!(root = %self.root.display(), "event loop finished");
    }

    /// Walk the root, ingesting every matching file and tombstoning
    /// documents under the root whose files no longer exist.
    pub async fn initial_scan(&self) -> Result<PassReport> {
        let (present, removed) = self.scan_events().await?;
        let mut report = PassReport::default();

        let mut set = JoinSet::new();
        for event in present {
            let pipeline = self.pipeline.clone();
            set.spawn(async move {
                pipeline
                    .ingest_file(&event.path, UploadMetadata::default())
                    .await
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    error!(error = %e, "scan task panicked");
                    report.failed += 1;
                }
            }
        }

        for event in removed {
            if self.pipeline.remove(&source_for_path(&event.path)).await? {
                report.removed += 1;
            }
        }

        self.activity().last_scan_at = Some(now_millis());
        info!(
            root = %self.root.display(),
            indexed = report.indexed,
            unchanged = report.unchanged,
            removed = report.removed,
            failed = report.failed,
            "scan complete"
        );
        Ok(report)
    }

    /// Events describing the tree as it is now: a `Modified` for every
    /// matching file and a `Removed` for every live document under the root
    /// whose file is gone.
    pub async fn scan_events(&self) -> Result<(Vec<FileEvent>, Vec<FileEvent>)> {
        let mut present = Vec::new();
        let mut seen = HashSet::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.filter.accepts(entry.path()) {
                continue;
            }
            seen.insert(source_for_path(entry.path()));
            present.push(FileEvent::new(entry.path(), FileEventKind::Modified));
        }
        present.sort_by(|a, b| a.path.cmp(&b.path));

        let root_source = source_for_path(&self.root);
        let mut removed = Vec::new();
        for doc in self.pipeline.registry().list_documents().await? {
            if doc.status == DocumentStatus::Deleted
                || seen.contains(&doc.source)
                || !Path::new(&doc.source).starts_with(&root_source)
            {
                continue;
            }
            let path = PathBuf::from(&doc.source);
            if !path.exists() {
                removed.push(FileEvent::new(path, FileEventKind::Removed));
            }
        }
        Ok((present, removed))
    }

    /// Re-ingest documents the registry reports stale since `since`.
    pub async fn retry_stale(&self, since: i64) -> Result<PassReport> {
        retry_stale(&self.pipeline, since).await
    }

    pub async fn status(&self) -> Result<IndexerStatus> {
        let mut status = IndexerStatus::collect(&self.pipeline).await?;
        let activity = self.activity();
        status.queued = activity.queued;
        status.in_flight = activity.in_flight;
        status.last_scan_at = activity.last_scan_at;
        Ok(status)
    }
}

impl IndexerStatus {
    /// Registry and index state, without event-loop activity.
    pub async fn collect(pipeline: &IngestPipeline) -> Result<Self> {
        let registry = pipeline.registry();
        let counts = registry.status_counts().await?;
        let failures = registry
            .failures()
            .await?
            .into_iter()
            .map(|doc| FailureReport {
                source: doc.source,
                error: doc.error.unwrap_or_default(),
            })
            .collect();
        let indexed_chunks = pipeline.index().count().await?;
        Ok(Self {
            counts,
            indexed_chunks,
            queued: 0,
            in_flight: 0,
            failures,
            last_scan_at: None,
        })
    }
}

/// Re-ingest documents the registry reports stale since `since` (Unix ms).
/// Files that disappeared are tombstoned; uploads are skipped since their
/// bytes are not kept.
pub async fn retry_stale(pipeline: &IngestPipeline, since: i64) -> Result<PassReport> {
    let stale = pipeline.registry().list_stale(since).await?;
    let mut report = PassReport::default();

    for doc in stale {
        if doc.source.starts_with("upload://") {
            debug!(source = %doc.source, "cannot re-read upload");
            report.skipped += 1;
            continue;
        }
        let path = PathBuf::from(&doc.source);
        if !path.exists() {
            if pipeline.remove(&doc.source).await? {
                report.removed += 1;
            }
            continue;
        }
        let outcome = pipeline.reingest_file(&path, doc.metadata.clone()).await;
        report.record(&outcome);
    }

    info!(
        since,
        indexed = report.indexed,
        failed = report.failed,
        skipped = report.skipped,
        "retry complete"
    );
    Ok(report)
}

/// Apply one event. Adds and modifications for paths that no longer exist
/// are treated as removals.
async fn handle_event(pipeline: IngestPipeline, filter: PathFilter, event: FileEvent) {
    let source = source_for_path(&event.path);
    let metadata = tokio::fs::metadata(&event.path).await.ok();

    if event.kind == FileEventKind::Removed || metadata.is_none() {
        match pipeline.remove(&source).await {
            Ok(true) => info!(source = %source, "document removed"),
            Ok(false) => debug!(source = %source, "removal of unknown document"),
            Err(e) => error!(source = %source, error = %e, "removal failed"),
        }
        if let Err(e) = remove_under(&pipeline, &source).await {
            error!(source = %source, error = %e, "removal under directory failed");
        }
        return;
    }

    if metadata.is_some_and(|m| m.is_dir()) {
        ingest_under(&pipeline, &filter, &event.path).await;
        return;
    }

    match pipeline
        .ingest_file(&event.path, UploadMetadata::default())
        .await
    {
        IngestOutcome::Failed { error, .. } => {
            warn!(source = %source, error = %error, "re-index failed")
        }
        outcome => debug!(source = %source, ?outcome, "event applied"),
    }
}

/// Tombstone live documents below the directory `source` whose files are
/// gone. Returns how many were removed.
async fn remove_under(pipeline: &IngestPipeline, source: &str) -> Result<usize> {
    let prefix = format!("{}{}", source.trim_end_matches(MAIN_SEPARATOR), MAIN_SEPARATOR);
    let mut removed = 0;
    for doc in pipeline.registry().list_by_source_prefix(&prefix).await? {
        if doc.status == DocumentStatus::Deleted || Path::new(&doc.source).exists() {
            continue;
        }
        if pipeline.remove(&doc.source).await? {
            removed += 1;
        }
    }
    if removed > 0 {
        info!(directory = %source, removed, "documents under removed directory tombstoned");
    }
    Ok(removed)
}

/// Ingest every matching file below a directory that appeared in the tree.
async fn ingest_under(pipeline: &IngestPipeline, filter: &PathFilter, dir: &Path) {
    for entry in WalkDir::new(dir).follow_links(false).into_iter().flatten() {
        if !entry.file_type().is_file() || !filter.accepts(entry.path()) {
            continue;
        }
        let outcome = pipeline
            .ingest_file(entry.path(), UploadMetadata::default())
            .await;
        if let IngestOutcome::Failed { error, .. } = outcome {
            warn!(path = %entry.path().display(), error = %error, "re-index failed");
        }
    }
}

// ============ CLI ============

fn resolve_root(app: &App, root: Option<&Path>) -> PathBuf {
    root.map(Path::to_path_buf)
        .or_else(|| app.config.watch.root.clone())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Build the indexer for `root`, falling back to `watch.root` and then the
/// current directory.
pub fn indexer_for(app: &App, root: Option<&Path>) -> anyhow::Result<IncrementalIndexer> {
    let root = resolve_root(app, root);
    IncrementalIndexer::new(app.pipeline.clone(), &root, &app.config.watch)
        .with_context(|| format!("Cannot index root: {}", root.display()))
}

/// CLI entry point for `kb scan`.
pub async fn run_scan(app: &App, root: Option<&Path>) -> anyhow::Result<()> {
    let indexer = indexer_for(app, root)?;
    println!("Scanning {}", indexer.root().display());
    let report = indexer.initial_scan().await.context("scan failed")?;
    print_report("scan", &report);
    Ok(())
}

/// CLI entry point for `kb retry`. `since` is a `YYYY-MM-DD` date; indexed
/// documents last indexed before its start are re-ingested too.
pub async fn run_retry(app: &App, since: Option<&str>) -> anyhow::Result<()> {
    let since_ms = match since {
        Some(since_str) => NaiveDate::parse_from_str(since_str, "%Y-%m-%d")
            .with_context(|| format!("Invalid --since date: {}", since_str))?
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or(0),
        None => 0,
    };
    let report = retry_stale(&app.pipeline, since_ms)
        .await
        .context("retry failed")?;
    print_report("retry", &report);
    Ok(())
}

/// CLI entry point for `kb status`.
pub async fn run_status(app: &App) -> anyhow::Result<()> {
    let status = IndexerStatus::collect(&app.pipeline)
        .await
        .context("status failed")?;

    println!("documents:");
    for (state, count) in &status.counts {
        println!("  {:<11} {}", state.as_str(), count);
    }
    println!("indexed chunks: {}", status.indexed_chunks);
    if !status.failures.is_empty() {
        println!("failures:");
        for failure in &status.failures {
            println!("  {}", failure.source);
            println!("    {}", failure.error);
        }
    }
    Ok(())
}

fn print_report(label: &str, report: &PassReport) {
    println!("{} complete", label);
    println!("  indexed:   {}", report.indexed);
    println!("  unchanged: {}", report.unchanged);
    println!("  removed:   {}", report.removed);
    println!("  failed:    {}", report.failed);
    if report.skipped > 0 {
        println!("  skipped:   {}", report.skipped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, IngestConfig};
    use crate::embedding::{DisabledEmbedder, HashingEmbedder};
    use crate::store::memory::{InMemoryIndex, InMemoryRegistry};
    use crate::store::{DocumentRegistry, VectorIndex};
    use crate::test_support::{gateway, CountingIndex};
    use tempfile::TempDir;

    fn watch_config(debounce_ms: u64) -> WatchConfig {
        WatchConfig {
            debounce_ms,
            ..Default::default()
        }
    }

    fn pipeline_with(
        registry: Arc<dyn DocumentRegistry>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn crate::embedding::Embedder>,
    ) -> IngestPipeline {
        IngestPipeline::new(
            registry,
            index,
            Arc::new(gateway(embedder)),
            &ChunkingConfig {
                size_tokens: 32,
                overlap_tokens: 4,
            },
            &IngestConfig::default(),
        )
        .unwrap()
    }

    fn pipeline() -> IngestPipeline {
        pipeline_with(
            Arc::new(InMemoryRegistry::new()),
            Arc::new(InMemoryIndex::new()),
            Arc::new(HashingEmbedder::new(16)),
        )
    }

    async fn status_of(indexer: &IncrementalIndexer, path: &Path) -> Option<DocumentStatus> {
        indexer
            .pipeline
            .registry()
            .get_by_source(&source_for_path(path))
            .await
            .unwrap()
            .map(|d| d.status)
    }

    #[test]
    fn filter_applies_globs_relative_to_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let filter = PathFilter::new(
            root,
            &WatchConfig {
                exclude_globs: vec!["drafts/**".to_string()],
                ..Default::default()
            },
        )
        .unwrap();

        assert!(filter.accepts(&root.join("guide.md")));
        assert!(filter.accepts(&root.join("docs/manual.pdf")));
        assert!(!filter.accepts(&root.join("logo.png")));
        assert!(!filter.accepts(&root.join("drafts/wip.md")));
        assert!(!filter.accepts(&root.join(".git/notes.txt")));
        assert!(!filter.accepts(Path::new("/elsewhere/guide.md")));

        assert!(filter.covers(&root.join("docs")));
        assert!(!filter.covers(root));
        assert!(!filter.covers(&root.join("node_modules/pkg")));
        assert!(!filter.covers(Path::new("/elsewhere/docs")));
    }

    #[test]
    fn bad_glob_is_invalid_config() {
        let err = PathFilter::new(
            Path::new("/"),
            &WatchConfig {
                include_globs: vec!["[".to_string()],
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn scan_indexes_matching_files_and_skips_unchanged() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.md"), "# Alpha\n\nFirst document.").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/b.txt"), "Second document.").unwrap();
        std::fs::write(tmp.path().join("image.png"), [0u8, 1, 2]).unwrap();

        let indexer = IncrementalIndexer::new(pipeline(), tmp.path(), &watch_config(10)).unwrap();
        let first = indexer.initial_scan().await.unwrap();
        assert_eq!(first.indexed, 2);
        assert_eq!(first.failed, 0);

        let second = indexer.initial_scan().await.unwrap();
        assert_eq!(second.indexed, 0);
        assert_eq!(second.unchanged, 2);

        let status = indexer.status().await.unwrap();
        assert!(status.last_scan_at.is_some());
        assert!(status
            .counts
            .contains(&(DocumentStatus::Indexed, 2)));
    }

    #[tokio::test]
    async fn scan_tombstones_vanished_files() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gone.md");
        std::fs::write(&path, "Soon to be deleted.").unwrap();

        let indexer = IncrementalIndexer::new(pipeline(), tmp.path(), &watch_config(10)).unwrap();
        indexer.initial_scan().await.unwrap();
        let canonical = indexer.root().join("gone.md");
        std::fs::remove_file(&path).unwrap();

        let report = indexer.initial_scan().await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(
            status_of(&indexer, &canonical).await,
            Some(DocumentStatus::Deleted)
        );
        assert_eq!(indexer.pipeline.index().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn burst_of_events_collapses_to_one_ingestion() {
        let tmp = TempDir::new().unwrap();
        let index = Arc::new(CountingIndex::default());
        let pipeline = pipeline_with(
            Arc::new(InMemoryRegistry::new()),
            index.clone(),
            Arc::new(HashingEmbedder::new(16)),
        );
        let indexer = IncrementalIndexer::new(pipeline, tmp.path(), &watch_config(50)).unwrap();
        let path = indexer.root().join("notes.md");

        let (tx, rx) = mpsc::channel(16);
        std::fs::write(&path, "draft one").unwrap();
        tx.send(FileEvent::new(&path, FileEventKind::Created))
            .await
            .unwrap();
        std::fs::write(&path, "draft two").unwrap();
        tx.send(FileEvent::new(&path, FileEventKind::Modified))
            .await
            .unwrap();
        std::fs::write(&path, "final text").unwrap();
        tx.send(FileEvent::new(&path, FileEventKind::Modified))
            .await
            .unwrap();
        drop(tx);

        indexer.run(rx).await;

        assert_eq!(index.writes(), 1);
        let doc = indexer
            .pipeline
            .registry()
            .get_by_source(&source_for_path(&path))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed);
        let chunks = indexer.pipeline.registry().chunks(&doc.id).await.unwrap();
        assert_eq!(chunks[0].text, "final text");
    }

    #[tokio::test]
    async fn removal_event_tombstones_document() {
        let tmp = TempDir::new().unwrap();
        let indexer = IncrementalIndexer::new(pipeline(), tmp.path(), &watch_config(10)).unwrap();
        let path = indexer.root().join("old.txt");
        std::fs::write(&path, "obsolete guidance").unwrap();
        indexer.initial_scan().await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(FileEvent::new(&path, FileEventKind::Removed))
            .await
            .unwrap();
        drop(tx);
        indexer.run(rx).await;

        assert_eq!(status_of(&indexer, &path).await, Some(DocumentStatus::Deleted));
        let doc = indexer
            .pipeline
            .registry()
            .get_by_source(&source_for_path(&path))
            .await
            .unwrap()
            .unwrap();
        assert!(doc.error.unwrap().starts_with("Source file deleted:"));
    }

    #[tokio::test]
    async fn modify_of_missing_file_is_a_removal() {
        let tmp = TempDir::new().unwrap();
        let indexer = IncrementalIndexer::new(pipeline(), tmp.path(), &watch_config(10)).unwrap();
        let path = indexer.root().join("flicker.md");
        std::fs::write(&path, "here now").unwrap();
        indexer.initial_scan().await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(FileEvent::new(&path, FileEventKind::Modified))
            .await
            .unwrap();
        drop(tx);
        indexer.run(rx).await;

        assert_eq!(status_of(&indexer, &path).await, Some(DocumentStatus::Deleted));
    }

    #[tokio::test]
    async fn removed_directory_tombstones_its_documents() {
        let tmp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let indexer = IncrementalIndexer::new(pipeline(), tmp.path(), &watch_config(10)).unwrap();
        let sub = indexer.root().join("sub");
        std::fs::create_dir_all(sub.join("deep")).unwrap();
        std::fs::write(sub.join("a.md"), "alpha notes").unwrap();
        std::fs::write(sub.join("deep/b.txt"), "beta notes").unwrap();
        let kept = indexer.root().join("subway.md");
        std::fs::write(&kept, "gamma notes").unwrap();
        indexer.initial_scan().await.unwrap();
        assert_eq!(indexer.pipeline.index().count().await.unwrap(), 3);

        std::fs::rename(&sub, outside.path().join("sub")).unwrap();
        let (tx, rx) = mpsc::channel(4);
        tx.send(FileEvent::new(&sub, FileEventKind::Removed))
            .await
            .unwrap();
        drop(tx);
        indexer.run(rx).await;

        for path in [sub.join("a.md"), sub.join("deep/b.txt")] {
            assert_eq!(status_of(&indexer, &path).await, Some(DocumentStatus::Deleted));
        }
        assert_eq!(status_of(&indexer, &kept).await, Some(DocumentStatus::Indexed));
        assert_eq!(indexer.pipeline.index().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn directory_moved_into_tree_is_indexed() {
        let tmp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let indexer = IncrementalIndexer::new(pipeline(), tmp.path(), &watch_config(10)).unwrap();
        let staged = outside.path().join("incoming");
        std::fs::create_dir(&staged).unwrap();
        std::fs::write(staged.join("a.md"), "arrived notes").unwrap();
        std::fs::write(staged.join("logo.png"), [0u8, 1]).unwrap();

        let dir = indexer.root().join("incoming");
        std::fs::rename(&staged, &dir).unwrap();
        let (tx, rx) = mpsc::channel(4);
        tx.send(FileEvent::new(&dir, FileEventKind::Created))
            .await
            .unwrap();
        drop(tx);
        indexer.run(rx).await;

        assert_eq!(
            status_of(&indexer, &dir.join("a.md")).await,
            Some(DocumentStatus::Indexed)
        );
        assert_eq!(status_of(&indexer, &dir.join("logo.png")).await, None);
    }

    #[tokio::test]
    async fn events_outside_filter_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let indexer = IncrementalIndexer::new(pipeline(), tmp.path(), &watch_config(10)).unwrap();
        let path = indexer.root().join("photo.png");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(FileEvent::new(&path, FileEventKind::Created))
            .await
            .unwrap();
        drop(tx);
        indexer.run(rx).await;

        assert_eq!(status_of(&indexer, &path).await, None);
    }

    #[tokio::test]
    async fn retry_recovers_failed_documents() {
        let tmp = TempDir::new().unwrap();
        let registry: Arc<dyn DocumentRegistry> = Arc::new(InMemoryRegistry::new());
        let index: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new());

        let broken = pipeline_with(registry.clone(), index.clone(), Arc::new(DisabledEmbedder));
        let indexer = IncrementalIndexer::new(broken, tmp.path(), &watch_config(10)).unwrap();
        let path = indexer.root().join("policy.md");
        std::fs::write(&path, "Passwords rotate quarterly.").unwrap();
        let report = indexer.initial_scan().await.unwrap();
        assert_eq!(report.failed, 1);

        let status = indexer.status().await.unwrap();
        assert_eq!(status.failures.len(), 1);
        assert!(status.failures[0].error.starts_with("embedding:"));

        let healthy = pipeline_with(registry, index, Arc::new(HashingEmbedder::new(16)));
        let indexer = IncrementalIndexer::new(healthy, tmp.path(), &watch_config(10)).unwrap();
        let report = indexer.retry_stale(0).await.unwrap();
        assert_eq!(report.indexed, 1);
        assert_eq!(status_of(&indexer, &path).await, Some(DocumentStatus::Indexed));
    }

    #[tokio::test]
    async fn retry_skips_uploads() {
        let tmp = TempDir::new().unwrap();
        let pipeline = pipeline_with(
            Arc::new(InMemoryRegistry::new()),
            Arc::new(InMemoryIndex::new()),
            Arc::new(DisabledEmbedder),
        );
        let outcome = pipeline
            .ingest_upload("notes.txt", b"uploaded text".to_vec(), None, UploadMetadata::default())
            .await;
        assert!(outcome.is_failed());

        let indexer = IncrementalIndexer::new(pipeline, tmp.path(), &watch_config(10)).unwrap();
        let report = indexer.retry_stale(0).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.indexed, 0);
    }
}
