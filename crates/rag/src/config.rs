use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use finrag_core::ChunkConfig;
use finrag_llm::LlmProvider;

use crate::error::{RagError, Result};

pub const DEFAULT_DB_PATH: &str = "data/finrag.sqlite";
pub const DEFAULT_COLLECTION: &str = "financial_filings";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub store: StoreConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: String,
    pub collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

impl ChunkingConfig {
    pub fn to_chunk_config(&self) -> ChunkConfig {
        ChunkConfig::new(self.chunk_size, self.chunk_overlap)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub retry_delay_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_delay_ms: 2_000,
            retry_delay_ms: 5_000,
        }
    }
}

impl EmbeddingConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub quota_backoff_ms: u64,
    pub top_k: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_delay_ms: 2_500,
            quota_backoff_ms: 15_000,
            top_k: 2,
        }
    }
}

impl IndexConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn quota_backoff(&self) -> Duration {
        Duration::from_millis(self.quota_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub provider: String,
    pub model: Option<String>,
    pub max_retries: usize,
    pub base_wait_ms: u64,
    pub min_call_spacing_ms: u64,
    pub tool_k: usize,
    pub compare_k: usize,
    pub max_steps: usize,
    pub enhance_queries: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Gemini.as_str().to_string(),
            model: None,
            max_retries: 3,
            base_wait_ms: 60_000,
            min_call_spacing_ms: 10_000,
            tool_k: 2,
            compare_k: 1,
            max_steps: 6,
            enhance_queries: true,
        }
    }
}

impl AgentConfig {
    pub fn provider(&self) -> Result<LlmProvider> {
        LlmProvider::from_str(&self.provider)
            .ok_or_else(|| RagError::Config(format!("unknown provider {}", self.provider)))
    }

    pub fn model_for(&self, provider: LlmProvider) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string())
    }

    pub fn base_wait(&self) -> Duration {
        Duration::from_millis(self.base_wait_ms)
    }

    pub fn min_call_spacing(&self) -> Duration {
        Duration::from_millis(self.min_call_spacing_ms)
    }
}

impl RagConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| RagError::Config(err.to_string()))
    }

    /// Overlays `FINRAG_*` environment variables onto the loaded values.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| env::var(name).ok());
    }

    pub(crate) fn apply_vars<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("FINRAG_DB_PATH") {
            self.store.db_path = v;
        }
        if let Some(v) = get("FINRAG_COLLECTION") {
            self.store.collection = v;
        }
        override_parsed(&mut self.chunking.chunk_size, get("FINRAG_CHUNK_SIZE"));
        override_parsed(&mut self.chunking.chunk_overlap, get("FINRAG_CHUNK_OVERLAP"));
        override_parsed(&mut self.embedding.batch_size, get("FINRAG_EMBED_BATCH_SIZE"));
        override_parsed(&mut self.embedding.batch_delay_ms, get("FINRAG_EMBED_BATCH_DELAY_MS"));
        override_parsed(&mut self.embedding.retry_delay_ms, get("FINRAG_EMBED_RETRY_DELAY_MS"));
        override_parsed(&mut self.index.batch_size, get("FINRAG_INDEX_BATCH_SIZE"));
        override_parsed(&mut self.index.batch_delay_ms, get("FINRAG_INDEX_BATCH_DELAY_MS"));
        override_parsed(&mut self.index.quota_backoff_ms, get("FINRAG_QUOTA_BACKOFF_MS"));
        override_parsed(&mut self.index.top_k, get("FINRAG_TOP_K"));
        if let Some(v) = get("FINRAG_PROVIDER") {
            self.agent.provider = v;
        }
        if let Some(v) = get("FINRAG_MODEL") {
            self.agent.model = Some(v);
        }
        override_parsed(&mut self.agent.max_retries, get("FINRAG_MAX_RETRIES"));
        override_parsed(&mut self.agent.base_wait_ms, get("FINRAG_BASE_WAIT_MS"));
        override_parsed(
            &mut self.agent.min_call_spacing_ms,
            get("FINRAG_MIN_CALL_SPACING_MS"),
        );
        override_parsed(&mut self.agent.max_steps, get("FINRAG_MAX_STEPS"));
        override_parsed(&mut self.agent.enhance_queries, get("FINRAG_ENHANCE_QUERIES"));
    }
}

fn override_parsed<T: FromStr>(slot: &mut T, value: Option<String>) {
    if let Some(parsed) = value.and_then(|v| v.trim().parse().ok()) {
        *slot = parsed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_the_documented_schedule() {
        let config = RagConfig::default();
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.embedding.batch_delay(), Duration::from_secs(2));
        assert_eq!(config.embedding.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.index.batch_delay(), Duration::from_millis(2_500));
        assert_eq!(config.index.quota_backoff(), Duration::from_secs(15));
        assert_eq!(config.agent.base_wait(), Duration::from_secs(60));
        assert_eq!(config.agent.min_call_spacing(), Duration::from_secs(10));
        assert_eq!(config.agent.provider().expect("provider"), LlmProvider::Gemini);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = RagConfig::from_toml_str(
            r#"
            [store]
            collection = "tenk"

            [agent]
            provider = "local"
            max_retries = 5
            "#,
        )
        .expect("toml");
        assert_eq!(config.store.collection, "tenk");
        assert_eq!(config.store.db_path, DEFAULT_DB_PATH);
        assert_eq!(config.agent.max_retries, 5);
        assert_eq!(config.agent.tool_k, 2);
        assert_eq!(config.agent.provider().expect("provider"), LlmProvider::Local);
        assert_eq!(config.agent.model_for(LlmProvider::Local), "local-router");
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = RagConfig::from_toml_str("[agent\nprovider = 1").expect_err("invalid");
        assert!(matches!(err, RagError::Config(_)));
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let vars: HashMap<&str, &str> = [
            ("FINRAG_COLLECTION", "override"),
            ("FINRAG_CHUNK_SIZE", "500"),
            ("FINRAG_MAX_RETRIES", "not-a-number"),
            ("FINRAG_ENHANCE_QUERIES", "false"),
            ("FINRAG_MODEL", "  "),
        ]
        .into_iter()
        .collect();
        let mut config = RagConfig::default();
        config.apply_vars(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.store.collection, "override");
        assert_eq!(config.chunking.chunk_size, 500);
        assert_eq!(config.agent.max_retries, 3);
        assert!(!config.agent.enhance_queries);
        assert_eq!(config.agent.model, None);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = AgentConfig {
            provider: "mystery".into(),
            ..AgentConfig::default()
        };
        assert!(config.provider().is_err());
    }
}
