//! Semantic search over the vector index.
//!
//! A query is embedded through the [`EmbeddingGateway`] and matched against
//! the [`VectorIndex`]. Hits below the similarity threshold are dropped.
//!
//! # Ordering
//!
//! Highest score first; ties go to the chunk ingested earliest, then to the
//! lower chunk id, so identical queries over an unchanged index return
//! identical lists.
//!
//! # Related Queries
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`search_document`](SearchService::search_document) | Search within one document |
//! | [`similar_documents`](SearchService::similar_documents) | Other documents close to a document's opening chunk |
//! | [`suggestions`](SearchService::suggestions) | Three-word phrases from matching chunks that contain a partial query |

use anyhow::Context;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::app::App;
use crate::embedding::EmbeddingGateway;
use crate::error::{Error, Result};
use crate::ingest::source_for_path;
use crate::models::{document_id_for, rank_order, IndexFilter, SearchHit};
use crate::store::{DocumentRegistry, VectorIndex};

/// Characters of a document's first chunk used as the similarity query.
const SIMILAR_QUERY_CHARS: usize = 500;

/// Candidate chunks fetched per requested similar document, so documents
/// with several close chunks do not crowd out the rest.
const SIMILAR_CANDIDATES_PER_DOCUMENT: usize = 4;

/// Minimum similarity for chunks mined for suggestions.
pub const SUGGESTION_THRESHOLD: f32 = 0.3;

/// Partial queries shorter than this get no suggestions.
const SUGGESTION_MIN_CHARS: usize = 3;

#[derive(Clone)]
pub struct SearchService {
    index: Arc<dyn VectorIndex>,
    gateway: Arc<EmbeddingGateway>,
    registry: Arc<dyn DocumentRegistry>,
}

impl SearchService {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        gateway: Arc<EmbeddingGateway>,
        registry: Arc<dyn DocumentRegistry>,
    ) -> Self {
        Self {
            index,
            gateway,
            registry,
        }
    }

    /// Up to `top_k` chunks scoring at least `threshold`.
    ///
    /// Blank queries and `top_k == 0` return an empty list without calling
    /// the embedding backend.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        threshold: f32,
        filter: &IndexFilter,
    ) -> Result<Vec<SearchHit>> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::InvalidConfig(format!(
                "similarity threshold {} is outside [0, 1]",
                threshold
            )));
        }
        if query.trim().is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let vector = self.gateway.embed_query(query).await?;
        let mut hits = self.index.query(&vector, top_k, filter).await?;
        hits.retain(|h| h.score >= threshold);
        hits.sort_by(rank_order);

        debug!(query, top_k, threshold, hits = hits.len(), "search complete");
        Ok(hits.into_iter().map(SearchHit::from).collect())
    }

    /// [`search`](Self::search) restricted to the chunks of one document.
    pub async fn search_document(
        &self,
        document_id: &str,
        query: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        let filter = IndexFilter {
            document_id: Some(document_id.to_string()),
            ..Default::default()
        };
        self.search(query, top_k, threshold, &filter).await
    }

    /// Up to `limit` other documents whose best chunk is close to the first
    /// chunk of `document_id`, one hit per document.
    ///
    /// A document without chunk records (unknown, failed, or deleted) has no
    /// similar documents.
    pub async fn similar_documents(
        &self,
        document_id: &str,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        let chunks = self.registry.chunks(document_id).await?;
        let Some(first) = chunks.first() else {
            return Ok(Vec::new());
        };
        let query: String = first.text.chars().take(SIMILAR_QUERY_CHARS).collect();
        let filter = IndexFilter {
            exclude_document: Some(document_id.to_string()),
            ..Default::default()
        };
        let candidates = self
            .search(
                &query,
                limit.saturating_mul(SIMILAR_CANDIDATES_PER_DOCUMENT),
                threshold,
                &filter,
            )
            .await?;

        let mut seen = HashSet::new();
        let similar: Vec<SearchHit> = candidates
            .into_iter()
            .filter(|hit| seen.insert(hit.document_id.clone()))
            .take(limit)
            .collect();
        debug!(document_id, similar = similar.len(), "similar documents");
        Ok(similar)
    }

    /// Up to `limit` distinct three-word phrases containing `partial`
    /// (case-insensitive), mined from the chunks closest to it.
    pub async fn suggestions(&self, partial: &str, limit: usize) -> Result<Vec<String>> {
        let partial = partial.trim();
        if partial.chars().count() < SUGGESTION_MIN_CHARS || limit == 0 {
            return Ok(Vec::new());
        }
        let needle = partial.to_lowercase();
        let hits = self
            .search(
                partial,
                limit.saturating_mul(2),
                SUGGESTION_THRESHOLD,
                &IndexFilter::default(),
            )
            .await?;

        let mut suggestions: Vec<String> = Vec::new();
        for hit in &hits {
            let words: Vec<&str> = hit.text.split_whitespace().collect();
            for window in words.windows(3) {
                let phrase = window.join(" ");
                if phrase.to_lowercase().contains(&needle) && !suggestions.contains(&phrase) {
                    suggestions.push(phrase);
                    if suggestions.len() >= limit {
                        return Ok(suggestions);
                    }
                }
            }
        }
        Ok(suggestions)
    }
}

/// Document id for a CLI argument: `upload://` sources are taken as-is,
/// anything else is a file path.
pub fn document_id_for_arg(arg: &str) -> String {
    if arg.starts_with("upload://") {
        document_id_for(arg)
    } else {
        document_id_for(&source_for_path(Path::new(arg)))
    }
}

/// CLI entry point for `kb search`.
pub async fn run_search(
    app: &App,
    query: &str,
    top_k: Option<usize>,
    threshold: Option<f32>,
    filter: IndexFilter,
) -> anyhow::Result<()> {
    let retrieval = &app.config.retrieval;
    let hits = app
        .search
        .search(
            query,
            top_k.unwrap_or(retrieval.top_k),
            threshold.unwrap_or(retrieval.similarity_threshold),
            &filter,
        )
        .await
        .context("search failed")?;

    print_hits(&hits);
    Ok(())
}

/// CLI entry point for `kb similar`.
pub async fn run_similar(
    app: &App,
    document: &str,
    limit: usize,
    threshold: Option<f32>,
) -> anyhow::Result<()> {
    let document_id = document_id_for_arg(document);
    let hits = app
        .search
        .similar_documents(
            &document_id,
            limit,
            threshold.unwrap_or(app.config.retrieval.partial_threshold),
        )
        .await
        .context("similarity search failed")?;
    print_hits(&hits);
    Ok(())
}

/// CLI entry point for `kb suggest`.
pub async fn run_suggest(app: &App, partial: &str, limit: usize) -> anyhow::Result<()> {
    let suggestions = app
        .search
        .suggestions(partial, limit)
        .await
        .context("suggestions failed")?;
    if suggestions.is_empty() {
        println!("No suggestions.");
    }
    for suggestion in suggestions {
        println!("{}", suggestion);
    }
    Ok(())
}

fn print_hits(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("No results.");
        return;
    }

    for (i, hit) in hits.iter().enumerate() {
        println!("{}. [{:.2}] {} #{}", i + 1, hit.score, hit.source, hit.chunk_index);
        if let Some(ref category) = hit.category {
            println!("    category: {}", category);
        }
        if !hit.tags.is_empty() {
            println!("    tags: {}", hit.tags.join(", "));
        }
        println!("    excerpt: \"{}\"", excerpt(&hit.text, 240));
        println!("    id: {}", hit.chunk_id);
        println!();
    }
}

/// First `max_chars` characters of `text` on one line.
pub(crate) fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    let trimmed = flat.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_chars).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ChunkMetadata, NewDocument, UploadMetadata, VectorEntry};
    use crate::store::memory::{InMemoryIndex, InMemoryRegistry};
    use crate::test_support::{at_similarity, gateway, KeywordEmbedder};

    fn entry(chunk_id: &str, text: &str, vector: Vec<f32>, ingested_at: i64) -> VectorEntry {
        VectorEntry {
            chunk_id: chunk_id.to_string(),
            vector,
            metadata: ChunkMetadata {
                document_id: format!("doc-{}", chunk_id),
                source: format!("{}.md", chunk_id),
                chunk_index: 0,
                text: text.to_string(),
                category: None,
                tags: Vec::new(),
                ingested_at,
            },
        }
    }

    async fn service(entries: Vec<VectorEntry>) -> SearchService {
        let index = Arc::new(InMemoryIndex::new());
        for e in &entries {
            index.upsert(e).await.unwrap();
        }
        let embedder = KeywordEmbedder::new(
            &[("configure auth", vec![1.0, 0.0, 0.0])],
            vec![0.0, 0.0, 1.0],
        );
        SearchService::new(
            index,
            Arc::new(gateway(Arc::new(embedder))),
            Arc::new(InMemoryRegistry::new()),
        )
    }

    fn doc_entry(chunk_id: &str, document_id: &str, text: &str, vector: Vec<f32>) -> VectorEntry {
        let mut e = entry(chunk_id, text, vector, 1);
        e.metadata.document_id = document_id.to_string();
        e.metadata.source = format!("{}.md", document_id);
        e
    }

    /// Registry holding one indexed document with a single chunk of `text`.
    async fn service_with_document(
        source: &str,
        text: &str,
    ) -> (SearchService, String) {
        let registry = Arc::new(InMemoryRegistry::new());
        let id = registry
            .upsert_document(&NewDocument {
                source: source.to_string(),
                content_hash: "h".to_string(),
                format: "md".to_string(),
                size_bytes: text.len() as u64,
                metadata: UploadMetadata::default(),
            })
            .await
            .unwrap();
        let chunk = Chunk {
            id: format!("{}-0", id),
            document_id: id.clone(),
            chunk_index: 0,
            text: text.to_string(),
            start_token: 0,
            end_token: 2,
            start_byte: 0,
            end_byte: text.len(),
            overlap_bytes: 0,
            hash: "c".to_string(),
        };
        registry.commit_indexed(&id, "h", &[chunk]).await.unwrap();

        let embedder = KeywordEmbedder::new(
            &[("configure auth", vec![1.0, 0.0, 0.0])],
            vec![0.0, 0.0, 1.0],
        );
        let search = SearchService::new(
            Arc::new(InMemoryIndex::new()),
            Arc::new(gateway(Arc::new(embedder))),
            registry,
        );
        (search, id)
    }

    #[tokio::test]
    async fn threshold_excludes_weak_matches() {
        let search = service(vec![
            entry("strong", "token setup", at_similarity(0.82), 1),
            entry("weak", "unrelated", at_similarity(0.55), 1),
        ])
        .await;

        let hits = search
            .search("how to configure auth", 5, 0.7, &IndexFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "strong");
        assert!((hits[0].score - 0.82).abs() < 1e-4);
    }

    #[tokio::test]
    async fn ties_prefer_earliest_ingestion() {
        let search = service(vec![
            entry("newer", "a", at_similarity(0.9), 200),
            entry("older", "b", at_similarity(0.9), 100),
            entry("best", "c", at_similarity(0.95), 300),
        ])
        .await;

        let hits = search
            .search("configure auth", 10, 0.0, &IndexFilter::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["best", "older", "newer"]);
    }

    #[tokio::test]
    async fn blank_query_and_zero_top_k_are_empty() {
        let search = service(vec![entry("a", "a", at_similarity(0.9), 1)]).await;
        assert!(search
            .search("   ", 5, 0.0, &IndexFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert!(search
            .search("configure auth", 0, 0.0, &IndexFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn empty_index_is_not_an_error() {
        let search = service(Vec::new()).await;
        let hits = search
            .search("configure auth", 5, 0.7, &IndexFilter::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn out_of_range_threshold_is_rejected() {
        let search = service(Vec::new()).await;
        let err = search
            .search("q", 5, 1.5, &IndexFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn document_search_stays_within_document() {
        let search = service(vec![
            doc_entry("a0", "doc-a", "a text", at_similarity(0.9)),
            doc_entry("b0", "doc-b", "b text", at_similarity(0.95)),
        ])
        .await;
        let hits = search
            .search_document("doc-a", "configure auth", 5, 0.0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "a0");
    }

    #[tokio::test]
    async fn similar_documents_exclude_self_and_collapse_per_document() {
        let (search, id) = service_with_document("/docs/self.md", "configure auth").await;
        let entries = vec![
            doc_entry("self0", &id, "self", at_similarity(1.0)),
            doc_entry("b0", "doc-b", "b best", at_similarity(0.9)),
            doc_entry("b1", "doc-b", "b second", at_similarity(0.85)),
            doc_entry("c0", "doc-c", "c", at_similarity(0.8)),
            doc_entry("d0", "doc-d", "d", at_similarity(0.3)),
        ];
        for e in &entries {
            search.index.upsert(e).await.unwrap();
        }

        let hits = search.similar_documents(&id, 5, 0.5).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b0", "c0"]);

        let one = search.similar_documents(&id, 1, 0.5).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].document_id, "doc-b");
    }

    #[tokio::test]
    async fn similar_documents_of_unknown_document_is_empty() {
        let search = service(vec![doc_entry("b0", "doc-b", "b", at_similarity(0.9))]).await;
        assert!(search
            .similar_documents("missing", 5, 0.0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn suggestions_are_phrases_containing_the_partial_query() {
        let search = service(vec![
            entry(
                "a",
                "Teams configure auth tokens before deploy. Operators configure auth daily.",
                at_similarity(0.9),
                1,
            ),
            entry("weak", "never configure auth here", at_similarity(0.1), 1),
        ])
        .await;

        let suggestions = search.suggestions("configure auth", 5).await.unwrap();
        assert_eq!(
            suggestions,
            vec![
                "Teams configure auth",
                "configure auth tokens",
                "Operators configure auth",
                "configure auth daily.",
            ]
        );
        assert_eq!(search.suggestions("configure auth", 2).await.unwrap().len(), 2);
        assert!(search.suggestions("co", 5).await.unwrap().is_empty());
    }

    #[test]
    fn document_ids_resolve_uploads_and_paths() {
        assert_eq!(
            document_id_for_arg("upload://notes.txt"),
            document_id_for("upload://notes.txt")
        );
        assert_eq!(
            document_id_for_arg("/docs/a.md"),
            document_id_for(&source_for_path(Path::new("/docs/a.md")))
        );
    }

    #[test]
    fn excerpt_flattens_and_truncates() {
        assert_eq!(excerpt("a\nb", 10), "a b");
        assert_eq!(excerpt("abcdef", 3), "abc...");
    }
}
