use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::document::{Chunk, Document};
use crate::error::{CoreError, Result};

/// Separators in priority order; the empty separator splits per character.
pub const DEFAULT_SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", " ", ""];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    #[serde(default = "default_separators")]
    pub separators: Vec<String>,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            separators: default_separators(),
        }
    }
}

impl ChunkConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            ..Self::default()
        }
    }
}

/// Recursive character splitter. Lengths are measured in chars, not bytes.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkConfig,
}

impl Chunker {
    pub fn new(config: ChunkConfig) -> Result<Self> {
        if config.chunk_size == 0 || config.chunk_overlap > config.chunk_size {
            return Err(CoreError::InvalidChunkConfig {
                chunk_size: config.chunk_size,
                chunk_overlap: config.chunk_overlap,
            });
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            warn!("empty text provided for splitting");
            return Vec::new();
        }
        let separators: Vec<&str> = self.config.separators.iter().map(String::as_str).collect();
        let chunks = self.split_recursive(text, &separators);
        debug!(chunks = chunks.len(), "split text");
        chunks
    }

    /// Chunks every document in input order; `chunk_index` restarts at zero per document.
    pub fn split_documents(&self, documents: &[Document]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for document in documents {
            for (idx, content) in self.split(&document.content).into_iter().enumerate() {
                chunks.push(Chunk::from_document(document, idx, content));
            }
        }
        tracing::info!(
            documents = documents.len(),
            chunks = chunks.len(),
            "split documents into chunks"
        );
        chunks
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let mut separator = separators.last().copied().unwrap_or("");
        let mut remaining: &[&str] = &[];
        for (idx, &candidate) in separators.iter().enumerate() {
            if candidate.is_empty() {
                separator = "";
                break;
            }
            if text.contains(candidate) {
                separator = candidate;
                remaining = &separators[idx + 1..];
                break;
            }
        }

        let mut chunks = Vec::new();
        let mut pending: Vec<&str> = Vec::new();
        for piece in split_keeping_separator(text, separator) {
            if char_len(piece) < self.config.chunk_size {
                pending.push(piece);
                continue;
            }
            if !pending.is_empty() {
                chunks.extend(self.merge(&pending));
                pending.clear();
            }
            if !remaining.is_empty() {
                chunks.extend(self.split_recursive(piece, remaining));
            } else if !separator.is_empty() {
                chunks.extend(self.split_recursive(piece, &[""]));
            } else if let Some(chunk) = join_pieces(std::iter::once(piece)) {
                chunks.push(chunk);
            }
        }
        if !pending.is_empty() {
            chunks.extend(self.merge(&pending));
        }
        chunks
    }

    // Greedy merge; the tail carried into the next chunk never exceeds chunk_overlap chars.
    fn merge(&self, pieces: &[&str]) -> Vec<String> {
        let size = self.config.chunk_size;
        let overlap = self.config.chunk_overlap;
        let mut merged = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;
        for piece in pieces {
            let len = char_len(piece);
            if total + len > size && !window.is_empty() {
                if let Some(chunk) = join_pieces(window.iter().copied()) {
                    merged.push(chunk);
                }
                while total > overlap || (total > 0 && total + len > size) {
                    match window.pop_front() {
                        Some(front) => total -= char_len(front),
                        None => break,
                    }
                }
            }
            window.push_back(piece);
            total += len;
        }
        if let Some(chunk) = join_pieces(window.iter().copied()) {
            merged.push(chunk);
        }
        merged
    }
}

fn default_separators() -> Vec<String> {
    DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

// The separator stays attached to the start of the piece that follows it.
fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(idx, ch)| &text[idx..idx + ch.len_utf8()])
            .collect();
    }
    let mut pieces = Vec::new();
    let mut start = 0usize;
    for (idx, _) in text.match_indices(separator) {
        if idx > start {
            pieces.push(&text[start..idx]);
        }
        start = idx;
    }
    pieces.push(&text[start..]);
    pieces.retain(|piece| !piece.is_empty());
    pieces
}

fn join_pieces<'a>(pieces: impl Iterator<Item = &'a str>) -> Option<String> {
    let joined: String = pieces.collect();
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
