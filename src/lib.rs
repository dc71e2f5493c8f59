//! # KB Harness
//!
//! A local-first knowledge base: documents are ingested from files or
//! uploads, split into overlapping token windows, embedded, and stored in a
//! vector index alongside a durable document registry. A watcher keeps the
//! index in step with a directory tree; search, question answering, and
//! completeness assessment read from the same index.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────────────────────┐   ┌───────────┐
//! │ Watcher  │──▶│  Indexer   │──▶│        Pipeline          │──▶│  SQLite   │
//! │ (notify) │   │ debounce + │   │ extract → chunk → embed  │   │ registry  │
//! └──────────┘   │ per-path   │   │ → index                  │   │ + vectors │
//!                └────────────┘   └──────────────────────────┘   └─────┬─────┘
//!                                                                       │
//!                              ┌──────────────┬─────────────────────────┤
//!                              ▼              ▼                         ▼
//!                         ┌────────┐     ┌─────────┐             ┌────────────┐
//!                         │ Search │     │   QA    │             │ Assessment │
//!                         └────────┘     └─────────┘             └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kb init                                   # create database
//! kb ingest handbook.pdf --category policy  # ingest files
//! kb watch ./docs                           # keep a tree indexed
//! kb search "key rotation"
//! kb ask "How often are API keys rotated?"
//! kb assess "API security" --aspect authentication --aspect encryption
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and identifiers |
//! | [`error`] | Error taxonomy |
//! | [`extract`] | PDF, DOCX, TXT, and Markdown text extraction |
//! | [`chunk`] | Token-window chunking |
//! | [`embedding`] | Embedding backends and the batching/retry gateway |
//! | [`store`] | Vector index and document registry (memory, SQLite) |
//! | [`ingest`] | Ingestion pipeline |
//! | [`indexer`] | Event-driven incremental indexing |
//! | [`watch`] | Filesystem watcher |
//! | [`search`] | Semantic search |
//! | [`completion`] | Text-generation backends |
//! | [`qa`] | Question answering with fallback |
//! | [`assess`] | Completeness assessment |
//! | [`app`] | Service wiring for the CLI |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod assess;
pub mod chunk;
pub mod completion;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod indexer;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod qa;
pub mod search;
pub mod store;
pub mod watch;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Error, Result};
