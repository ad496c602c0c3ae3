use std::sync::Arc;
use tracing::{error, info, warn};

use finrag_core::{Chunker, Document};

use crate::clock::Clock;
use crate::config::RagConfig;
use crate::embedding::{Embedder, EmbeddingBatcher};
use crate::error::Result;
use crate::store::{MetadataFilter, RetrievalResult, VectorIndex};

pub const NO_DOCUMENTS_CONTEXT: &str =
    "No documents available. Please fetch and index SEC 10-K filings first.";
pub const NO_RELEVANT_CONTEXT: &str = "No relevant context found for this query. Try rephrasing or ensure the relevant companies' filings are indexed.";

/// Outcome of a guarded lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Retrieval {
    /// The index holds nothing; the index was not queried.
    NoDocuments,
    /// The index was queried and nothing matched.
    Empty,
    Found(Vec<RetrievalResult>),
}

impl Retrieval {
    pub fn into_results(self) -> Vec<RetrievalResult> {
        match self {
            Retrieval::Found(results) => results,
            Retrieval::NoDocuments | Retrieval::Empty => Vec::new(),
        }
    }
}

/// Ingestion and query-time retrieval over one vector index collection.
#[derive(Clone)]
pub struct FilingRetriever {
    chunker: Chunker,
    index: VectorIndex,
    default_k: usize,
}

impl FilingRetriever {
    pub fn new(chunker: Chunker, index: VectorIndex, default_k: usize) -> Self {
        Self {
            chunker,
            index,
            default_k: default_k.max(1),
        }
    }

    pub fn from_config(
        config: &RagConfig,
        embedder: Arc<dyn Embedder>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let chunker = Chunker::new(config.chunking.to_chunk_config())?;
        let batcher = EmbeddingBatcher::new(embedder, clock.clone(), &config.embedding);
        let index = VectorIndex::open(
            &config.store.db_path,
            config.store.collection.clone(),
            batcher,
            clock,
            &config.index,
        )?;
        Ok(Self::new(chunker, index, config.index.top_k))
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// Chunks, embeds and stores `documents`; returns the number of chunks written.
    pub fn add_documents(&self, documents: &[Document]) -> Result<usize> {
        if documents.is_empty() {
            warn!("no documents provided to add");
            return Ok(0);
        }
        let chunks = self.chunker.split_documents(documents);
        if chunks.is_empty() {
            warn!(documents = documents.len(), "no chunks created from documents");
            return Ok(0);
        }
        let written = self.index.upsert(&chunks)?;
        info!(documents = documents.len(), chunks = written, "added documents to vector store");
        Ok(written)
    }

    pub fn count(&self) -> usize {
        self.index.count()
    }

    pub fn has_documents(&self) -> bool {
        self.count() > 0
    }

    pub fn clear(&self) -> Result<()> {
        self.index.clear()
    }

    /// Searches the index unless it is empty. Index failures are logged and read as `Empty`.
    pub fn lookup(&self, query: &str, k: Option<usize>, ticker: Option<&str>) -> Retrieval {
        let filter = ticker.map(MetadataFilter::ticker);
        self.lookup_filtered(query, k, filter.as_ref())
    }

    pub fn lookup_filtered(
        &self,
        query: &str,
        k: Option<usize>,
        filter: Option<&MetadataFilter>,
    ) -> Retrieval {
        if !self.has_documents() {
            warn!("vector store is empty, skipping search");
            return Retrieval::NoDocuments;
        }
        let k = k.unwrap_or(self.default_k);
        match self.index.search(query, k, filter) {
            Ok(results) if results.is_empty() => Retrieval::Empty,
            Ok(results) => Retrieval::Found(results),
            Err(err) => {
                error!(error = %err, "error searching vector store");
                Retrieval::Empty
            }
        }
    }

    pub fn search(&self, query: &str, k: Option<usize>, ticker: Option<&str>) -> Vec<RetrievalResult> {
        self.lookup(query, k, ticker).into_results()
    }

    /// Like [`search`](Self::search) with every metadata constraint in `filter` applied.
    pub fn search_filtered(
        &self,
        query: &str,
        k: Option<usize>,
        filter: &MetadataFilter,
    ) -> Vec<RetrievalResult> {
        self.lookup_filtered(query, k, Some(filter)).into_results()
    }

    pub fn search_by_ticker(&self, query: &str, ticker: &str, k: Option<usize>) -> Vec<RetrievalResult> {
        self.search(query, k, Some(ticker))
    }

    /// Retrieved passages rendered as labelled source blocks, most relevant first.
    pub fn get_context_for_query(&self, query: &str, k: Option<usize>) -> String {
        match self.lookup(query, k, None) {
            Retrieval::NoDocuments => NO_DOCUMENTS_CONTEXT.to_string(),
            Retrieval::Empty => NO_RELEVANT_CONTEXT.to_string(),
            Retrieval::Found(results) => results
                .iter()
                .enumerate()
                .map(|(i, result)| {
                    format!(
                        "[Source {} - {} - {}]\n{}\n",
                        i + 1,
                        result.metadata.ticker,
                        result.metadata.filing_date,
                        result.content
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}
