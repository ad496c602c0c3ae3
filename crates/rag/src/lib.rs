pub mod clock;
pub mod config;
pub mod embedding;
pub mod error;
pub mod orchestrator;
pub mod retrieval;
pub mod store;
pub mod tools;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AgentConfig, ChunkingConfig, EmbeddingConfig, IndexConfig, RagConfig, StoreConfig};
pub use embedding::{
    Embedder, EmbeddingBackend, EmbeddingBatcher, EmbeddingClient, EmbeddingError,
    GeminiEmbeddingClient, OpenAiEmbeddingClient,
};
pub use finrag_core::{enhance_query, strip_annotation};
pub use error::{RagError, Result};
pub use orchestrator::{
    extract_answer, Pacer, QueryOrchestrator, RetryPolicy, RetryState, ValidationError,
};
pub use retrieval::{FilingRetriever, Retrieval};
pub use store::{MetadataFilter, RecordMetadata, RetrievalResult, VectorIndex};
pub use tools::{FilingTools, ToolInvocation, ToolKind, ToolParseError};
pub use finrag_llm::{ChatMessage, LlmClient, LlmProvider, ReasoningService};
