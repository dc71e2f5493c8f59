//! Error taxonomy for the ingestion, indexing, and retrieval core.
//!
//! Library components return [`Result<T>`]; the CLI and configuration
//! layers wrap these in `anyhow` with context.

use thiserror::Error;

/// Errors raised by the knowledge-base core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt input: {0}")]
    CorruptInput(String),

    #[error("input of {size} bytes exceeds the {limit} byte ceiling")]
    InputTooLarge { size: u64, limit: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("embedding backend unavailable after {attempts} attempt(s): {cause}")]
    EmbeddingUnavailable { attempts: u32, cause: String },

    #[error("embedding request rejected: {0}")]
    EmbeddingRejected(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector index write failed: {0}")]
    IndexWrite(String),

    #[error("vector index query failed: {0}")]
    IndexQuery(String),

    #[error("document registry error: {0}")]
    Registry(String),

    #[error("concurrent update conflict for document {0}")]
    RegistryConflict(String),

    #[error("index/registry consistency violation: {0}")]
    Consistency(String),

    #[error("completion service unavailable: {0}")]
    CompletionUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps a storage error raised while writing to the vector index.
    pub(crate) fn index_write(err: impl std::fmt::Display) -> Self {
        Error::IndexWrite(err.to_string())
    }

    /// Wraps a storage error raised while querying the vector index.
    pub(crate) fn index_query(err: impl std::fmt::Display) -> Self {
        Error::IndexQuery(err.to_string())
    }

    pub(crate) fn registry(err: impl std::fmt::Display) -> Self {
        Error::Registry(err.to_string())
    }
}
