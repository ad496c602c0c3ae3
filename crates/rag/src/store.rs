use bytemuck::{cast_slice, pod_collect_to_vec};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use finrag_core::Chunk;

use crate::clock::Clock;
use crate::config::IndexConfig;
use crate::embedding::EmbeddingBatcher;
use crate::error::{RagError, Result};

/// Provenance stored next to every indexed vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub ticker: String,
    pub filing_date: String,
    pub chunk_index: usize,
    pub source_ref: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalResult {
    pub content: String,
    pub metadata: RecordMetadata,
    /// Cosine distance to the query; lower is more similar.
    pub score: f32,
}

/// Exact-match constraints on record metadata. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub ticker: Option<String>,
    pub filing_date: Option<String>,
    pub source_ref: Option<String>,
    pub chunk_index: Option<usize>,
}

impl MetadataFilter {
    pub fn ticker(ticker: impl Into<String>) -> Self {
        Self {
            ticker: Some(ticker.into()),
            ..Self::default()
        }
    }

    pub fn with_filing_date(mut self, filing_date: impl Into<String>) -> Self {
        self.filing_date = Some(filing_date.into());
        self
    }

    pub fn with_source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    pub fn with_chunk_index(mut self, chunk_index: usize) -> Self {
        self.chunk_index = Some(chunk_index);
        self
    }

    fn where_clause(&self, values: &mut Vec<SqlValue>) -> String {
        let mut clause = String::new();
        let mut push = |column: &str, value: SqlValue| {
            values.push(value);
            clause.push_str(&format!(" AND records.{column} = ?{}", values.len()));
        };
        if let Some(ticker) = &self.ticker {
            push("ticker", SqlValue::Text(ticker.clone()));
        }
        if let Some(filing_date) = &self.filing_date {
            push("filing_date", SqlValue::Text(filing_date.clone()));
        }
        if let Some(source_ref) = &self.source_ref {
            push("source_ref", SqlValue::Text(source_ref.clone()));
        }
        if let Some(chunk_index) = self.chunk_index {
            push("chunk_index", SqlValue::Integer(chunk_index as i64));
        }
        clause
    }
}

/// Named collection of embedded chunks in a sqlite file.
///
/// Each operation opens its own connection. Writes are embedded through the
/// [`EmbeddingBatcher`] and paced so bulk ingestion stays under upstream quotas.
#[derive(Clone)]
pub struct VectorIndex {
    path: PathBuf,
    collection: String,
    batcher: EmbeddingBatcher,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    batch_delay: Duration,
    quota_backoff: Duration,
}

impl VectorIndex {
    pub fn open<P: AsRef<Path>>(
        path: P,
        collection: impl Into<String>,
        batcher: EmbeddingBatcher,
        clock: Arc<dyn Clock>,
        config: &IndexConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let index = Self {
            path,
            collection: collection.into(),
            batcher,
            clock,
            batch_size: config.batch_size.max(1),
            batch_delay: config.batch_delay(),
            quota_backoff: config.quota_backoff(),
        };
        index.init()?;
        let conn = index.connection()?;
        index.ensure_collection(&conn)?;
        info!(path = %index.path.display(), collection = %index.collection, "opened vector index");
        Ok(index)
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }

    fn init(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS collections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                dimensions INTEGER,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS records (
                collection_id INTEGER NOT NULL,
                record_id TEXT NOT NULL,
                content TEXT NOT NULL,
                ticker TEXT NOT NULL,
                filing_date TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                source_ref TEXT NOT NULL,
                embedding BLOB NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (collection_id, record_id),
                FOREIGN KEY(collection_id) REFERENCES collections(id)
            );
            CREATE INDEX IF NOT EXISTS idx_records_ticker ON records(collection_id, ticker);
            "#,
        )?;
        Ok(())
    }

    fn collection_row(&self, conn: &Connection) -> Result<Option<(i64, Option<usize>)>> {
        let row = conn
            .query_row(
                "SELECT id, dimensions FROM collections WHERE name = ?1",
                [&self.collection],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(id, dims)| (id, dims.map(|d| d as usize))))
    }

    fn ensure_collection(&self, conn: &Connection) -> Result<(i64, Option<usize>)> {
        if let Some(row) = self.collection_row(conn)? {
            return Ok(row);
        }
        conn.execute(
            "INSERT INTO collections (name) VALUES (?1)",
            params![self.collection],
        )?;
        Ok((conn.last_insert_rowid(), None))
    }

    /// Embeds and stores `chunks` in batches, keyed by chunk id so re-ingesting a
    /// document replaces its records. A quota failure sleeps `quota_backoff` and
    /// retries that batch exactly once.
    pub fn upsert(&self, chunks: &[Chunk]) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let batches: Vec<&[Chunk]> = chunks.chunks(self.batch_size).collect();
        let total = batches.len();
        info!(
            chunks = chunks.len(),
            batch_size = self.batch_size,
            collection = %self.collection,
            "upserting chunks"
        );
        for (idx, batch) in batches.iter().enumerate() {
            match self.write_batch(batch) {
                Ok(()) => {}
                Err(err) if err.is_quota() => {
                    warn!(
                        batch = idx + 1,
                        error = %err,
                        backoff_ms = self.quota_backoff.as_millis() as u64,
                        "quota hit while upserting, retrying batch once"
                    );
                    self.clock.sleep(self.quota_backoff);
                    self.write_batch(batch)?;
                }
                Err(err) => {
                    error!(batch = idx + 1, error = %err, "failed to upsert batch");
                    return Err(err);
                }
            }
            info!(batch = idx + 1, total, "processed batch");
            if idx + 1 < total {
                self.clock.sleep(self.batch_delay);
            }
        }
        Ok(chunks.len())
    }

    fn write_batch(&self, batch: &[Chunk]) -> Result<()> {
        let texts: Vec<String> = batch.iter().map(|chunk| chunk.content.clone()).collect();
        let vectors = self.batcher.embed_many(&texts, Some(texts.len()))?;
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let (collection_id, dims) = self.ensure_collection(&tx)?;
        let dims = self.check_dimensions(&tx, collection_id, dims, &vectors)?;
        for (chunk, vector) in batch.iter().zip(&vectors) {
            tx.execute(
                "INSERT OR REPLACE INTO records (collection_id, record_id, content, ticker, filing_date, chunk_index, source_ref, embedding) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    collection_id,
                    chunk.chunk_id,
                    chunk.content,
                    chunk.ticker,
                    chunk.filing_date,
                    chunk.chunk_index as i64,
                    chunk.source_ref,
                    cast_slice::<f32, u8>(vector),
                ],
            )?;
        }
        tx.commit()?;
        tracing::debug!(records = batch.len(), dims, "wrote batch");
        Ok(())
    }

    fn check_dimensions(
        &self,
        tx: &Transaction<'_>,
        collection_id: i64,
        recorded: Option<usize>,
        vectors: &[Vec<f32>],
    ) -> Result<usize> {
        let expected = match recorded.or_else(|| vectors.first().map(Vec::len)) {
            Some(dims) => dims,
            None => return Ok(0),
        };
        if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
            return Err(RagError::DimensionMismatch {
                collection: self.collection.clone(),
                expected,
                actual: bad.len(),
            });
        }
        if recorded.is_none() {
            tx.execute(
                "UPDATE collections SET dimensions = ?1 WHERE id = ?2",
                params![expected as i64, collection_id],
            )?;
        }
        Ok(expected)
    }

    /// Nearest records to `query` by cosine distance, most similar first.
    /// An empty collection answers `[]` without contacting the embedding service.
    pub fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievalResult>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let conn = self.connection()?;
        let Some((collection_id, dims)) = self.collection_row(&conn)? else {
            return Ok(Vec::new());
        };
        if self.count_in(&conn, collection_id)? == 0 {
            return Ok(Vec::new());
        }
        let query_vector = self.batcher.embed_one(query)?;
        if let Some(expected) = dims {
            if query_vector.len() != expected {
                return Err(RagError::DimensionMismatch {
                    collection: self.collection.clone(),
                    expected,
                    actual: query_vector.len(),
                });
            }
        }

        let mut values = vec![SqlValue::Integer(collection_id)];
        let filter_sql = filter
            .map(|filter| filter.where_clause(&mut values))
            .unwrap_or_default();
        let sql = format!(
            "SELECT record_id, content, ticker, filing_date, chunk_index, source_ref, embedding FROM records WHERE records.collection_id = ?1{filter_sql} ORDER BY rowid"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut hits = Vec::new();
        while let Some(row) = rows.next()? {
            let record_id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(6)?;
            if blob.len() % std::mem::size_of::<f32>() != 0 {
                return Err(RagError::CorruptEmbedding { record_id });
            }
            let embedding: Vec<f32> = pod_collect_to_vec(&blob);
            if embedding.len() != query_vector.len() {
                return Err(RagError::CorruptEmbedding { record_id });
            }
            hits.push(RetrievalResult {
                content: row.get(1)?,
                metadata: RecordMetadata {
                    ticker: row.get(2)?,
                    filing_date: row.get(3)?,
                    chunk_index: row.get::<_, i64>(4)? as usize,
                    source_ref: row.get(5)?,
                },
                score: 1.0 - cosine_similarity(&query_vector, &embedding),
            });
        }
        hits.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }

    fn count_in(&self, conn: &Connection, collection_id: i64) -> Result<usize> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection_id = ?1",
            [collection_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn try_count(&self) -> Result<usize> {
        let conn = self.connection()?;
        match self.collection_row(&conn)? {
            Some((collection_id, _)) => self.count_in(&conn, collection_id),
            None => Ok(0),
        }
    }

    /// Number of records in the collection; failures are logged and reported as 0.
    pub fn count(&self) -> usize {
        match self.try_count() {
            Ok(count) => count,
            Err(err) => {
                error!(error = %err, collection = %self.collection, "failed to count records");
                0
            }
        }
    }

    /// Drops the collection and recreates it empty, forgetting its dimension.
    pub fn clear(&self) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        if let Some((collection_id, _)) = self.collection_row(&tx)? {
            tx.execute(
                "DELETE FROM records WHERE collection_id = ?1",
                [collection_id],
            )?;
            tx.execute("DELETE FROM collections WHERE id = ?1", [collection_id])?;
        }
        self.ensure_collection(&tx)?;
        tx.commit()?;
        info!(collection = %self.collection, "vector store cleared");
        Ok(())
    }

    pub fn dimensions(&self) -> Option<usize> {
        let conn = self.connection().ok()?;
        self.collection_row(&conn).ok().flatten().and_then(|(_, dims)| dims)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut a_norm = 0.0f32;
    let mut b_norm = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        a_norm += x * x;
        b_norm += y * y;
    }
    if a_norm == 0.0 || b_norm == 0.0 {
        return 0.0;
    }
    dot / (a_norm.sqrt() * b_norm.sqrt())
}
