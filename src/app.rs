//! Wiring of the shared services behind the CLI.
//!
//! [`App::open`] connects to SQLite, applies migrations, and builds every
//! service over one registry, one index, and one embedding gateway, so the
//! pipeline, search, QA, and assessment all see the same state.

use anyhow::Context;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

use crate::assess::CompletenessAssessor;
use crate::completion::create_completer;
use crate::config::Config;
use crate::db;
use crate::embedding::EmbeddingGateway;
use crate::ingest::IngestPipeline;
use crate::migrate;
use crate::qa::QaSynthesizer;
use crate::search::SearchService;
use crate::store::sqlite::{SqliteIndex, SqliteRegistry};
use crate::store::{DocumentRegistry, VectorIndex};

pub struct App {
    pub config: Config,
    pub pool: SqlitePool,
    pub registry: Arc<dyn DocumentRegistry>,
    pub index: Arc<dyn VectorIndex>,
    pub pipeline: IngestPipeline,
    pub search: SearchService,
    pub qa: QaSynthesizer,
    pub assessor: CompletenessAssessor,
}

impl App {
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool)
            .await
            .context("Failed to apply migrations")?;

        let registry: Arc<dyn DocumentRegistry> = Arc::new(SqliteRegistry::new(pool.clone()));
        let index: Arc<dyn VectorIndex> = Arc::new(SqliteIndex::new(pool.clone()));
        let gateway = Arc::new(EmbeddingGateway::from_config(&config.embedding)?);
        let completer = create_completer(&config.completion)?;

        let pipeline = IngestPipeline::new(
            registry.clone(),
            index.clone(),
            gateway.clone(),
            &config.chunking,
            &config.ingest,
        )?;
        let search = SearchService::new(index.clone(), gateway.clone(), registry.clone());
        let qa = QaSynthesizer::new(
            search.clone(),
            completer,
            &config.retrieval,
            &config.completion,
        );
        let assessor = CompletenessAssessor::new(search.clone(), &config.retrieval);

        debug!(
            db = %config.db.path.display(),
            embedder = gateway.model_name(),
            dims = gateway.dims(),
            "services ready"
        );

        Ok(Self {
            config,
            pool,
            registry,
            index,
            pipeline,
            search,
            qa,
            assessor,
        })
    }

    /// Flush and close the database pool.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// CLI entry point for `kb init`.
pub async fn run_init(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;
    println!("Database initialized at {}", config.db.path.display());
    Ok(())
}
