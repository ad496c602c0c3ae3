use thiserror::Error;

use finrag_core::CoreError;

use crate::embedding::EmbeddingError;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("embedding service failed: {0}")]
    UpstreamEmbedding(#[source] EmbeddingError),
    #[error("vector store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("collection {collection} holds {expected}-dimensional vectors, got {actual}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },
    #[error("embedding service returned {actual} vectors for {expected} inputs")]
    EmbeddingCount { expected: usize, actual: usize },
    #[error("stored embedding for record {record_id} is corrupt")]
    CorruptEmbedding { record_id: String },
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<EmbeddingError> for RagError {
    fn from(err: EmbeddingError) -> Self {
        RagError::UpstreamEmbedding(err)
    }
}

impl RagError {
    /// True when the failure came from an upstream quota or rate limit.
    pub fn is_quota(&self) -> bool {
        match self {
            RagError::UpstreamEmbedding(err) => err.is_quota(),
            _ => false,
        }
    }
}
