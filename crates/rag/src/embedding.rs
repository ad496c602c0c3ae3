use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use finrag_core::{HashEmbedder, HashEmbedderConfig};
use finrag_llm::is_quota_message;

use crate::clock::Clock;
use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("{provider} embeddings rate limited (429): {body}")]
    RateLimited { provider: &'static str, body: String },
    #[error("{provider} embeddings request failed (status {status}): {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("{provider} embeddings transport error: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to decode {provider} embeddings response: {message}")]
    Decode {
        provider: &'static str,
        message: String,
    },
    #[error("{var} is required for {provider} embeddings")]
    MissingApiKey {
        var: &'static str,
        provider: &'static str,
    },
}

impl EmbeddingError {
    pub fn is_quota(&self) -> bool {
        match self {
            EmbeddingError::RateLimited { .. } => true,
            EmbeddingError::MissingApiKey { .. } => false,
            other => is_quota_message(&other.to_string()),
        }
    }

    /// Failures worth one more attempt: quota, network trouble and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            EmbeddingError::Transport { .. } => true,
            EmbeddingError::Status { status, .. } if *status >= 500 => true,
            other => other.is_quota(),
        }
    }
}

/// Batch embedding service: one call turns N texts into N vectors.
pub trait Embedder: Send + Sync {
    fn embed_batch(&self, inputs: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError>;
}

#[derive(Clone)]
pub enum EmbeddingBackend {
    Hash(HashEmbedder),
    OpenAi(OpenAiEmbeddingClient),
    Gemini(GeminiEmbeddingClient),
}

#[derive(Clone)]
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
}

impl EmbeddingClient {
    pub fn from_env() -> std::result::Result<Self, EmbeddingError> {
        let provider = env::var("EMBEDDING_PROVIDER")
            .unwrap_or_else(|_| "hash".to_string())
            .to_lowercase();
        let backend = match provider.as_str() {
            "openai" => {
                let model = env::var("EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "text-embedding-3-small".to_string());
                EmbeddingBackend::OpenAi(OpenAiEmbeddingClient::new(&model)?)
            }
            "gemini" | "google" => {
                let model = env::var("EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "text-embedding-004".to_string());
                EmbeddingBackend::Gemini(GeminiEmbeddingClient::new(&model)?)
            }
            _ => {
                let dimensions = env::var("HASH_EMBED_DIMENSIONS")
                    .ok()
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(HashEmbedderConfig::default().dimensions);
                EmbeddingBackend::Hash(HashEmbedder::new(HashEmbedderConfig {
                    dimensions,
                    ..HashEmbedderConfig::default()
                }))
            }
        };
        Ok(Self { backend })
    }

    pub fn hash() -> Self {
        Self {
            backend: EmbeddingBackend::Hash(HashEmbedder::new(HashEmbedderConfig::default())),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.backend {
            EmbeddingBackend::Hash(_) => "hash",
            EmbeddingBackend::OpenAi(_) => "openai",
            EmbeddingBackend::Gemini(_) => "gemini",
        }
    }
}

impl Embedder for EmbeddingClient {
    fn embed_batch(&self, inputs: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        match &self.backend {
            EmbeddingBackend::Hash(embedder) => {
                Ok(inputs.iter().map(|text| embedder.embed_text(text)).collect())
            }
            EmbeddingBackend::OpenAi(client) => client.embed_batch(inputs),
            EmbeddingBackend::Gemini(client) => client.embed_batch(inputs),
        }
    }
}

#[derive(Clone)]
pub struct OpenAiEmbeddingClient {
    http: Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl OpenAiEmbeddingClient {
    const PROVIDER: &'static str = "openai";

    pub fn new(model: &str) -> std::result::Result<Self, EmbeddingError> {
        let api_key = env::var("OPENAI_API_KEY").map_err(|_| EmbeddingError::MissingApiKey {
            var: "OPENAI_API_KEY",
            provider: Self::PROVIDER,
        })?;
        Ok(Self {
            http: http_client(Self::PROVIDER)?,
            model: model.to_string(),
            api_key,
            base_url: env::var("OPENAI_BASE_URL").unwrap_or_else(|_| OPENAI_BASE_URL.to_string()),
        })
    }

    pub fn embed_batch(&self, inputs: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "input": inputs,
        });
        let request = self.http.post(url).bearer_auth(&self.api_key).json(&payload);
        let parsed: OpenAiEmbeddingResponse = send(Self::PROVIDER, request)?;
        let mut data = parsed.data;
        data.sort_by_key(|item| item.index);
        Ok(data.into_iter().map(|item| item.embedding).collect())
    }
}

#[derive(Clone)]
pub struct GeminiEmbeddingClient {
    http: Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl GeminiEmbeddingClient {
    const PROVIDER: &'static str = "gemini";

    pub fn new(model: &str) -> std::result::Result<Self, EmbeddingError> {
        let api_key = ["GEMINI_API_KEY", "GOOGLE_AI_STUDIO_API_KEY"]
            .iter()
            .find_map(|var| env::var(var).ok().filter(|v| !v.trim().is_empty()))
            .ok_or(EmbeddingError::MissingApiKey {
                var: "GEMINI_API_KEY",
                provider: Self::PROVIDER,
            })?;
        Ok(Self {
            http: http_client(Self::PROVIDER)?,
            model: model.trim_start_matches("models/").to_string(),
            api_key,
            base_url: env::var("GEMINI_BASE_URL").unwrap_or_else(|_| GEMINI_BASE_URL.to_string()),
        })
    }

    pub fn embed_batch(&self, inputs: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!(
            "{}/models/{}:batchEmbedContents",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let requests: Vec<_> = inputs
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{}", self.model),
                    "content": { "parts": [{ "text": text }] },
                    "taskType": "RETRIEVAL_DOCUMENT",
                })
            })
            .collect();
        let request = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&json!({ "requests": requests }));
        let parsed: GeminiEmbeddingResponse = send(Self::PROVIDER, request)?;
        Ok(parsed.embeddings.into_iter().map(|item| item.values).collect())
    }
}

fn http_client(provider: &'static str) -> std::result::Result<Client, EmbeddingError> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|source| EmbeddingError::Transport { provider, source })
}

fn send<T: serde::de::DeserializeOwned>(
    provider: &'static str,
    request: RequestBuilder,
) -> std::result::Result<T, EmbeddingError> {
    let response = request
        .send()
        .map_err(|source| EmbeddingError::Transport { provider, source })?;
    let status = response.status();
    let body = response.text().unwrap_or_default();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(EmbeddingError::RateLimited { provider, body });
    }
    if !status.is_success() {
        return Err(EmbeddingError::Status {
            provider,
            status: status.as_u16(),
            body,
        });
    }
    serde_json::from_str(&body).map_err(|err| EmbeddingError::Decode {
        provider,
        message: err.to_string(),
    })
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct GeminiEmbeddingResponse {
    #[serde(default)]
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

/// Paces calls to an [`Embedder`] so bulk work stays under a per-minute quota.
#[derive(Clone)]
pub struct EmbeddingBatcher {
    embedder: Arc<dyn Embedder>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    batch_delay: Duration,
    retry_delay: Duration,
}

impl EmbeddingBatcher {
    pub fn new(embedder: Arc<dyn Embedder>, clock: Arc<dyn Clock>, config: &EmbeddingConfig) -> Self {
        Self {
            embedder,
            clock,
            batch_size: config.batch_size.max(1),
            batch_delay: config.batch_delay(),
            retry_delay: config.retry_delay(),
        }
    }

    /// Embeds one text. A transient failure is retried once after `retry_delay`.
    pub fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let input = [text.to_string()];
        let vectors = match self.embedder.embed_batch(&input) {
            Ok(vectors) => vectors,
            Err(err) if err.is_transient() => {
                warn!(
                    error = %err,
                    delay_ms = self.retry_delay.as_millis() as u64,
                    "embedding failed, retrying once"
                );
                self.clock.sleep(self.retry_delay);
                self.embedder.embed_batch(&input)?
            }
            Err(err) => return Err(err.into()),
        };
        let mut vectors = expect_count(vectors, 1)?;
        Ok(vectors.remove(0))
    }

    /// Embeds `texts` in consecutive batches, pausing `batch_delay` between batches.
    /// Any failed batch aborts the whole call.
    pub fn embed_many(&self, texts: &[String], batch_size: Option<usize>) -> Result<Vec<Vec<f32>>> {
        let batch_size = batch_size.unwrap_or(self.batch_size).max(1);
        let total = texts.len();
        let mut out = Vec::with_capacity(total);
        if total == 0 {
            return Ok(out);
        }
        info!(total, batch_size, "embedding texts");
        for (idx, batch) in texts.chunks(batch_size).enumerate() {
            if idx > 0 {
                self.clock.sleep(self.batch_delay);
            }
            let vectors = self.embedder.embed_batch(batch)?;
            out.extend(expect_count(vectors, batch.len())?);
            info!(done = out.len(), total, "embedded batch");
        }
        Ok(out)
    }
}

fn expect_count(vectors: Vec<Vec<f32>>, expected: usize) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        return Err(RagError::EmbeddingCount {
            expected,
            actual: vectors.len(),
        });
    }
    Ok(vectors)
}
