//! Filesystem watching for `kb watch`.
//!
//! Bridges `notify` (through `notify-debouncer-mini`) into the bounded
//! [`FileEvent`] channel consumed by [`IncrementalIndexer::run`]. The
//! debouncer only coalesces raw OS notifications; per-path debouncing and
//! serialization happen in the indexer.
//!
//! The mini debouncer does not say what kind of change happened, so a path
//! that still exists is reported as `Modified` and one that is gone as
//! `Removed`.

use anyhow::Context;
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app::App;
use crate::indexer::{indexer_for, FileEvent, FileEventKind};

/// Coalescing window for raw OS notifications.
const NOTIFY_TICK: Duration = Duration::from_millis(100);

/// Watch `root` recursively, sending one [`FileEvent`] per changed path.
///
/// Sending blocks the notifier thread when the channel is full. Dropping
/// the returned debouncer stops watching and closes the sender.
pub fn watch_tree(
    root: &Path,
    tx: mpsc::Sender<FileEvent>,
) -> anyhow::Result<Debouncer<RecommendedWatcher>> {
    let mut debouncer = new_debouncer(
        NOTIFY_TICK,
        move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
            Ok(events) => {
                for event in events {
                    let kind = if event.path.exists() {
                        FileEventKind::Modified
                    } else {
                        FileEventKind::Removed
                    };
                    debug!(path = %event.path.display(), ?kind, "fs notification");
                    if tx.blocking_send(FileEvent::new(event.path, kind)).is_err() {
                        debug!("event channel closed");
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "watch error"),
        },
    )
    .context("Failed to create watcher")?;

    debouncer
        .watcher()
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", root.display()))?;
    Ok(debouncer)
}

/// CLI entry point for `kb watch`: scan once, then apply changes until
/// interrupted.
pub async fn run_watch(app: &App, root: Option<&Path>) -> anyhow::Result<()> {
    let indexer = indexer_for(app, root)?;
    let report = indexer.initial_scan().await.context("initial scan failed")?;
    println!(
        "Initial scan of {}: {} indexed, {} unchanged, {} removed, {} failed",
        indexer.root().display(),
        report.indexed,
        report.unchanged,
        report.removed,
        report.failed
    );

    let (tx, rx) = mpsc::channel(app.config.watch.channel_capacity);
    let debouncer = watch_tree(indexer.root(), tx)?;
    info!(root = %indexer.root().display(), "watching for changes");
    println!("Watching {} (Ctrl-C to stop)", indexer.root().display());

    let worker = {
        let indexer = indexer.clone();
        tokio::spawn(async move { indexer.run(rx).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("stopping watcher");
    drop(debouncer);

    if let Err(e) = worker.await {
        error!(error = %e, "indexer task failed");
    }
    println!("Stopped.");
    Ok(())
}
