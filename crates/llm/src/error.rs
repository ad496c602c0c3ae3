use thiserror::Error;

/// Lowercase markers that identify quota or rate-limit failures in free-form error text.
pub const QUOTA_MARKERS: [&str; 6] = [
    "429",
    "resource_exhausted",
    "resource exhausted",
    "quota",
    "rate limit",
    "too many requests",
];

pub fn is_quota_message(text: &str) -> bool {
    let lower = text.to_lowercase();
    QUOTA_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("{provider} rate limited the request (429): {body}")]
    RateLimited { provider: &'static str, body: String },
    #[error("{provider} returned error (status {status}): {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("{provider} request failed: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to decode {provider} response: {message}")]
    Decode {
        provider: &'static str,
        message: String,
    },
    #[error("{0} is not set")]
    MissingApiKey(&'static str),
    #[error("invalid api key in {var}: {reason}")]
    InvalidApiKey { var: &'static str, reason: String },
    #[error("failed to start tokio runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Structured 429s are quota errors; everything else falls back to marker matching.
    pub fn is_quota(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::MissingApiKey(_) | LlmError::InvalidApiKey { .. } => false,
            other => is_quota_message(&other.to_string()),
        }
    }
}
