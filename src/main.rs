//! # Knowledge Base CLI (`kb`)
//!
//! The `kb` binary drives the knowledge base: ingest documents, keep a
//! directory tree indexed, search, ask questions, and assess coverage.
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the SQLite database and run schema migrations |
//! | `kb ingest <paths>...` | Ingest PDF, DOCX, TXT, or Markdown files |
//! | `kb scan [root]` | Index a directory tree once, dropping vanished files |
//! | `kb watch [root]` | Scan, then keep the index in step with changes |
//! | `kb search "<query>"` | Semantic search over indexed chunks |
//! | `kb similar <path>` | Documents similar to an indexed document |
//! | `kb suggest "<partial>"` | Phrase suggestions for a partial query |
//! | `kb ask "<question>"` | Answer a question from retrieved context |
//! | `kb assess <topic>` | Report coverage of a topic's aspects |
//! | `kb status` | Document counts per status and recorded failures |
//! | `kb retry` | Re-ingest failed and stale documents |
//! | `kb remove <path>` | Remove a document from the index |
//!
//! Log verbosity follows `RUST_LOG` (default `kb_harness=info`); logs go to
//! stderr so command output stays clean.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use kb_harness::app::{self, App};
use kb_harness::models::{IndexFilter, UploadMetadata};
use kb_harness::{assess, config, indexer, ingest, qa, search, watch};

/// Knowledge base CLI: incremental document ingestion, semantic search,
/// question answering, and completeness assessment.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kb.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "A local-first knowledge base with incremental indexing and semantic search",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest one or more files.
    ///
    /// Unchanged files are skipped. Exits non-zero if any file fails.
    Ingest {
        /// Files to ingest (.pdf, .docx, .txt, .md).
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Category recorded on every chunk.
        #[arg(long)]
        category: Option<String>,

        /// Tag recorded on every chunk (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Index a directory tree once.
    ///
    /// Defaults to `watch.root` from the config, then the current directory.
    Scan { root: Option<PathBuf> },

    /// Scan a directory tree, then watch it for changes until Ctrl-C.
    Watch { root: Option<PathBuf> },

    /// Search indexed chunks by meaning.
    Search {
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum similarity in [0, 1].
        #[arg(long)]
        threshold: Option<f32>,

        /// Only chunks with this category.
        #[arg(long)]
        category: Option<String>,

        /// Only chunks carrying this tag.
        #[arg(long)]
        tag: Option<String>,

        /// Only chunks of this document (file path or `upload://` source).
        #[arg(long)]
        document: Option<String>,
    },

    /// List documents similar to an indexed document.
    Similar {
        /// File path or `upload://` source of the document.
        document: String,

        /// Maximum number of documents.
        #[arg(long, default_value_t = 5)]
        limit: usize,

        /// Minimum similarity in [0, 1]. Defaults to `retrieval.partial_threshold`.
        #[arg(long)]
        threshold: Option<f32>,
    },

    /// Suggest three-word phrases for a partial query.
    Suggest {
        partial: String,

        /// Maximum number of suggestions.
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Answer a question from the knowledge base.
    Ask {
        question: String,

        /// Maximum number of chunks used as context.
        #[arg(long, default_value_t = 5)]
        context_limit: usize,
    },

    /// Assess how completely the knowledge base covers a topic.
    Assess {
        topic: String,

        /// Aspect that should be covered (repeatable). Without any, common
        /// aspects for the topic are suggested.
        #[arg(long = "aspect")]
        aspects: Vec<String>,
    },

    /// Show document counts per status and recorded failures.
    Status,

    /// Re-ingest failed, unfinished, and stale documents.
    Retry {
        /// Also re-ingest indexed documents last indexed before this date
        /// (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,
    },

    /// Remove a file's document from the index.
    Remove { path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kb_harness=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        return app::run_init(&cfg).await;
    }

    let app = App::open(cfg).await?;
    let result = match cli.command {
        Commands::Init => Ok(()),
        Commands::Ingest {
            paths,
            category,
            tags,
        } => ingest::run_ingest(&app, &paths, UploadMetadata { category, tags }).await,
        Commands::Scan { root } => indexer::run_scan(&app, root.as_deref()).await,
        Commands::Watch { root } => watch::run_watch(&app, root.as_deref()).await,
        Commands::Search {
            query,
            top_k,
            threshold,
            category,
            tag,
            document,
        } => {
            let filter = IndexFilter {
                document_id: document.as_deref().map(search::document_id_for_arg),
                category,
                tag,
                ..Default::default()
            };
            search::run_search(&app, &query, top_k, threshold, filter).await
        }
        Commands::Similar {
            document,
            limit,
            threshold,
        } => search::run_similar(&app, &document, limit, threshold).await,
        Commands::Suggest { partial, limit } => search::run_suggest(&app, &partial, limit).await,
        Commands::Ask {
            question,
            context_limit,
        } => qa::run_ask(&app, &question, context_limit).await,
        Commands::Assess { topic, aspects } => assess::run_assess(&app, &topic, &aspects).await,
        Commands::Status => indexer::run_status(&app).await,
        Commands::Retry { since } => indexer::run_retry(&app, since.as_deref()).await,
        Commands::Remove { path } => ingest::run_remove(&app, &path).await,
    };
    app.close().await;
    result
}
