use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid chunk config: chunk_size={chunk_size}, chunk_overlap={chunk_overlap}")]
    InvalidChunkConfig {
        chunk_size: usize,
        chunk_overlap: usize,
    },
    #[error("invalid document on line {line}: {source}")]
    InvalidDocument {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;
