//! Error types for the retrieval engine.

use thiserror::Error;

use exemplar_embeddings::EmbeddingError;

use crate::exemplar::Polarity;

/// Result type alias for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Errors that can occur in the retrieval engine.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Rule ID is not present in the active catalog.
    #[error("rule {0} not found in the catalog")]
    UnknownRule(String),

    /// Knowledge base contains no rules.
    #[error("knowledge base contains no rules")]
    EmptyKnowledgeBase,

    /// A knowledge-base record could not be turned into an exemplar.
    #[error("malformed {polarity} record #{position} for rule {rule}: {reason}")]
    MalformedRecord {
        rule: String,
        polarity: Polarity,
        position: usize,
        reason: String,
    },

    /// Rule ID cannot be used as a catalog key.
    #[error("invalid rule id {0:?}")]
    InvalidRuleId(String),

    /// Embedding provider failed.
    #[error("embedding error: {0}")]
    Embedding(#[source] EmbeddingError),

    /// Embedder output does not match the index dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    EmbeddingDimensionMismatch { expected: usize, actual: usize },

    /// Persisted index file could not be decoded.
    #[error("corrupt index {path}: {reason}")]
    CorruptIndex { path: String, reason: String },

    /// Catalog path does not exist.
    #[error("catalog not found at {0}")]
    NotFound(String),

    /// No catalog has been built or loaded yet.
    #[error("no catalog loaded; build or load one first")]
    CatalogNotLoaded,

    /// Requested result count is out of range.
    #[error("invalid top_k {0}: must be at least 1 and within the configured maximum")]
    InvalidTopK(usize),

    /// Text generation failed.
    #[error("generation error: {0}")]
    Generation(String),

    /// Reranking failed.
    #[error("rerank error: {0}")]
    Rerank(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Background search task failed.
    #[error("search task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EmbeddingError> for RetrievalError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::DimensionMismatch { expected, actual } => {
                Self::EmbeddingDimensionMismatch { expected, actual }
            }
            other => Self::Embedding(other),
        }
    }
}
