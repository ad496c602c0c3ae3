use std::io::BufRead;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};

/// Placeholder for metadata the ingestion side did not provide.
pub const UNKNOWN: &str = "unknown";

/// A filing handed over by the ingestion collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub content: String,
    #[serde(default = "unknown")]
    pub ticker: String,
    #[serde(default = "unknown")]
    pub filing_date: String,
    #[serde(default = "unknown", alias = "file_path")]
    pub source_ref: String,
}

impl Document {
    pub fn new(
        content: impl Into<String>,
        ticker: impl Into<String>,
        filing_date: impl Into<String>,
        source_ref: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            ticker: ticker.into(),
            filing_date: filing_date.into(),
            source_ref: source_ref.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub content: String,
    pub chunk_index: usize,
    pub ticker: String,
    pub filing_date: String,
    pub source_ref: String,
}

impl Chunk {
    pub(crate) fn from_document(document: &Document, chunk_index: usize, content: String) -> Self {
        let chunk_id = stable_chunk_id(document, chunk_index, &content);
        Self {
            chunk_id,
            content,
            chunk_index,
            ticker: document.ticker.clone(),
            filing_date: document.filing_date.clone(),
            source_ref: document.source_ref.clone(),
        }
    }
}

/// Reads one JSON `Document` per line, skipping blank lines.
pub fn read_documents<R: BufRead>(reader: R) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let document = serde_json::from_str(&line).map_err(|source| CoreError::InvalidDocument {
            line: idx + 1,
            source,
        })?;
        documents.push(document);
    }
    Ok(documents)
}

fn unknown() -> String {
    UNKNOWN.to_string()
}

fn stable_chunk_id(document: &Document, chunk_index: usize, content: &str) -> String {
    let mut hasher = Sha256::new();
    for field in [
        document.source_ref.as_str(),
        document.ticker.as_str(),
        document.filing_date.as_str(),
    ] {
        hasher.update(field.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update((chunk_index as u64).to_be_bytes());
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
