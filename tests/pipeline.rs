//! End-to-end pipeline tests over the SQLite stores.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kb_harness::config::{ChunkingConfig, IngestConfig};
use kb_harness::embedding::{EmbeddingGateway, GatewaySettings, HashingEmbedder};
use kb_harness::ingest::{IngestOutcome, IngestPipeline, IngestRequest};
use kb_harness::models::{DocumentStatus, IndexFilter, UploadMetadata};
use kb_harness::search::SearchService;
use kb_harness::store::sqlite::{SqliteIndex, SqliteRegistry};
use kb_harness::store::{DocumentRegistry, VectorIndex};
use kb_harness::{db, migrate};
use sqlx::SqlitePool;
use tempfile::TempDir;

struct Harness {
    pool: SqlitePool,
    pipeline: IngestPipeline,
    search: SearchService,
}

async fn open(db_path: &Path) -> Harness {
    let pool = db::connect_path(db_path).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let registry: Arc<dyn DocumentRegistry> = Arc::new(SqliteRegistry::new(pool.clone()));
    let index: Arc<dyn VectorIndex> = Arc::new(SqliteIndex::new(pool.clone()));
    let gateway = Arc::new(EmbeddingGateway::new(
        Arc::new(HashingEmbedder::new(128)),
        GatewaySettings {
            batch_size: 8,
            max_retries: 1,
            backoff: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        },
    ));
    let pipeline = IngestPipeline::new(
        registry.clone(),
        index.clone(),
        gateway.clone(),
        &ChunkingConfig {
            size_tokens: 16,
            overlap_tokens: 4,
        },
        &IngestConfig::default(),
    )
    .unwrap();
    let search = SearchService::new(index, gateway, registry);
    Harness {
        pool,
        pipeline,
        search,
    }
}

fn numbered_words(prefix: &str, n: usize) -> String {
    (0..n)
        .map(|i| format!("{}{}", prefix, i))
        .collect::<Vec<_>>()
        .join(" ")
}

fn request(source: &str, text: &str) -> IngestRequest {
    IngestRequest {
        source: source.to_string(),
        bytes: text.as_bytes().to_vec(),
        format_hint: "text/plain".to_string(),
        metadata: UploadMetadata::default(),
    }
}

async fn assert_consistent(h: &Harness, document_id: &str) {
    let registry = h.pipeline.registry();
    let doc = registry.get(document_id).await.unwrap().unwrap();
    let recorded = registry.chunks(document_id).await.unwrap().len();
    let indexed = h.pipeline.index().count_for_document(document_id).await.unwrap();
    if doc.status == DocumentStatus::Indexed {
        assert_eq!(recorded, indexed, "registry and index disagree");
        assert!(indexed > 0);
    } else {
        assert_eq!(indexed, 0, "{} document still has index entries", doc.status);
    }
}

#[tokio::test]
async fn ingested_chunks_are_searchable() {
    let tmp = TempDir::new().unwrap();
    let h = open(&tmp.path().join("kb.sqlite")).await;

    let text = numbered_words("word", 40);
    let outcome = h.pipeline.ingest(request("notes/long.txt", &text)).await;
    let IngestOutcome::Indexed { document_id, chunks } = outcome.clone() else {
        panic!("unexpected outcome: {:?}", outcome);
    };
    assert_eq!(chunks, 3);
    assert_consistent(&h, &document_id).await;

    let stored = h.pipeline.registry().chunks(&document_id).await.unwrap();
    let hits = h
        .search
        .search(&stored[2].text, 3, 0.5, &IndexFilter::default())
        .await
        .unwrap();
    assert_eq!(hits[0].chunk_id, stored[2].id);
    assert!(hits[0].score > 0.99);
}

#[tokio::test]
async fn modified_content_replaces_old_chunks() {
    let tmp = TempDir::new().unwrap();
    let h = open(&tmp.path().join("kb.sqlite")).await;

    let first = h
        .pipeline
        .ingest(request("guide.txt", &numbered_words("old", 40)))
        .await;
    let document_id = first.document_id().unwrap().to_string();
    let old_ids: Vec<String> = h
        .pipeline
        .registry()
        .chunks(&document_id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();

    let second = h
        .pipeline
        .ingest(request("guide.txt", &numbered_words("new", 20)))
        .await;
    assert!(matches!(second, IngestOutcome::Indexed { chunks: 2, .. }));
    assert_consistent(&h, &document_id).await;

    let hits = h
        .search
        .search(&numbered_words("old", 16), 10, 0.0, &IndexFilter::default())
        .await
        .unwrap();
    assert!(hits.iter().all(|hit| !old_ids.contains(&hit.chunk_id)));
    assert!(hits.iter().all(|hit| !hit.text.contains("old")));
}

#[tokio::test]
async fn concurrent_ingestions_of_one_source_stay_consistent() {
    let tmp = TempDir::new().unwrap();
    let h = open(&tmp.path().join("kb.sqlite")).await;

    let requests: Vec<IngestRequest> = (0..8)
        .map(|i| request("shared.txt", &numbered_words(&format!("v{}x", i), 24 + i)))
        .collect();
    let outcomes = h.pipeline.ingest_batch(requests).await;
    assert_eq!(outcomes.len(), 8);
    assert!(outcomes.iter().all(|o| !o.is_failed()), "{:?}", outcomes);

    let document_id = outcomes[0].document_id().unwrap().to_string();
    assert_consistent(&h, &document_id).await;
    let docs = h.pipeline.registry().list_documents().await.unwrap();
    assert_eq!(docs.len(), 1);
}

#[tokio::test]
async fn batch_isolates_failures() {
    let tmp = TempDir::new().unwrap();
    let h = open(&tmp.path().join("kb.sqlite")).await;

    let mut corrupt = request("broken.docx", "");
    corrupt.bytes = b"PK\x03\x04 not really a zip".to_vec();
    corrupt.format_hint = "broken.docx".to_string();

    let outcomes = h
        .pipeline
        .ingest_batch(vec![
            request("a.txt", "alpha text"),
            corrupt,
            request("c.txt", "gamma text"),
        ])
        .await;

    assert!(matches!(outcomes[0], IngestOutcome::Indexed { .. }));
    let IngestOutcome::Failed { error, document_id } = outcomes[1].clone() else {
        panic!("expected failure, got {:?}", outcomes[1]);
    };
    assert!(error.starts_with("extracting: corrupt input"), "{}", error);
    assert!(matches!(outcomes[2], IngestOutcome::Indexed { .. }));

    let failed_id = document_id.unwrap();
    assert_consistent(&h, &failed_id).await;
    let failures = h.pipeline.registry().failures().await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].source, "broken.docx");
}

#[tokio::test]
async fn removal_hides_document_from_search() {
    let tmp = TempDir::new().unwrap();
    let h = open(&tmp.path().join("kb.sqlite")).await;

    let text = "Rotate signing keys every ninety days.";
    let outcome = h.pipeline.ingest(request("keys.txt", text)).await;
    let document_id = outcome.document_id().unwrap().to_string();

    assert!(h.pipeline.remove("keys.txt").await.unwrap());
    assert!(!h.pipeline.remove("keys.txt").await.unwrap());

    let doc = h.pipeline.registry().get(&document_id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Deleted);
    assert_eq!(doc.error.as_deref(), Some("Source file deleted: keys.txt"));
    assert_consistent(&h, &document_id).await;

    let hits = h
        .search
        .search(text, 5, 0.0, &IndexFilter::default())
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn duplicate_upload_is_reported() {
    let tmp = TempDir::new().unwrap();
    let h = open(&tmp.path().join("kb.sqlite")).await;

    let bytes = b"Quarterly security review checklist.".to_vec();
    let first = h
        .pipeline
        .ingest_upload("review.txt", bytes.clone(), None, UploadMetadata::default())
        .await;
    assert!(matches!(first, IngestOutcome::Indexed { .. }));

    let second = h
        .pipeline
        .ingest_upload("copy-of-review.txt", bytes, None, UploadMetadata::default())
        .await;
    let IngestOutcome::Duplicate { source, .. } = second.clone() else {
        panic!("expected duplicate, got {:?}", second);
    };
    assert_eq!(source, "upload://review.txt");
}

#[tokio::test]
async fn index_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("kb.sqlite");
    let text = "Backups are verified every Sunday night.";

    {
        let h = open(&db_path).await;
        let outcome = h.pipeline.ingest(request("backups.txt", text)).await;
        assert!(matches!(outcome, IngestOutcome::Indexed { .. }));
        h.pool.close().await;
    }

    let h = open(&db_path).await;
    let hits = h
        .search
        .search(text, 1, 0.9, &IndexFilter::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source, "backups.txt");

    let again = h.pipeline.ingest(request("backups.txt", text)).await;
    assert!(matches!(again, IngestOutcome::Unchanged { .. }));
}
