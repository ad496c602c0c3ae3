mod chunk;
mod document;
mod embedding;
mod enhance;
mod error;

pub use chunk::{ChunkConfig, Chunker, DEFAULT_SEPARATORS};
pub use document::{read_documents, Chunk, Document, UNKNOWN};
pub use embedding::{HashEmbedder, HashEmbedderConfig};
pub use enhance::{enhance_query, strip_annotation, ANNOTATION_MARKER};
pub use error::{CoreError, Result};
