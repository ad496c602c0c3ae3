mod error;
mod gemini;
mod local;
mod message;
mod openai;
mod tool;

pub use error::{is_quota_message, LlmError, QUOTA_MARKERS};
pub use message::{ChatMessage, ContentPart, MessageContent, Role, TextFragment, ToolCall};
pub use tool::{ToolBox, ToolSpec};

use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::env;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

use gemini::GeminiConfig;
use openai::OpenAiConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_MAX_STEPS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Gemini,
    OpenAi,
    Local,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Gemini => "gemini",
            LlmProvider::OpenAi => "openai",
            LlmProvider::Local => "local",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "gemini" | "google" => Some(LlmProvider::Gemini),
            "openai" => Some(LlmProvider::OpenAi),
            "local" => Some(LlmProvider::Local),
            _ => None,
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::Gemini => "gemini-1.5-flash",
            LlmProvider::OpenAi => "gpt-4o-mini",
            LlmProvider::Local => "local-router",
        }
    }
}

/// A tool-calling reasoning service.
///
/// `invoke` runs the whole exchange for one question and returns the full transcript:
/// the input conversation followed by every generated assistant and tool message.
pub trait ReasoningService: Send + Sync {
    fn invoke(
        &self,
        system: &str,
        conversation: &[ChatMessage],
        tools: &dyn ToolBox,
    ) -> Result<Vec<ChatMessage>, LlmError>;
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    provider: LlmProvider,
    model: String,
    config: ProviderConfig,
    max_steps: usize,
}

#[derive(Clone)]
enum ProviderConfig {
    Gemini(GeminiConfig),
    OpenAi(OpenAiConfig),
    Local,
}

impl LlmClient {
    pub fn new(provider: LlmProvider, model: impl Into<String>) -> Result<Self, LlmError> {
        let model = model.into();
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| LlmError::Transport {
                provider: provider.as_str(),
                source,
            })?;
        let config = match provider {
            LlmProvider::Gemini => ProviderConfig::Gemini(GeminiConfig {
                api_key: read_api_key(&["GEMINI_API_KEY", "GOOGLE_AI_STUDIO_API_KEY"])?,
                base_url: env::var("GEMINI_BASE_URL")
                    .unwrap_or_else(|_| gemini::DEFAULT_BASE_URL.to_string()),
            }),
            LlmProvider::OpenAi => ProviderConfig::OpenAi(OpenAiConfig {
                api_key: read_api_key(&["OPENAI_API_KEY"])?,
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| openai::DEFAULT_BASE_URL.to_string()),
            }),
            LlmProvider::Local => ProviderConfig::Local,
        };
        Ok(Self {
            http,
            provider,
            model,
            config,
            max_steps: DEFAULT_MAX_STEPS,
        })
    }

    /// Offline client that routes questions to tools without any network access.
    pub fn local() -> Self {
        Self {
            http: Client::new(),
            provider: LlmProvider::Local,
            model: LlmProvider::Local.default_model().to_string(),
            config: ProviderConfig::Local,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        system: &str,
        transcript: &[ChatMessage],
        specs: &[ToolSpec],
    ) -> Result<ChatMessage, LlmError> {
        match &self.config {
            ProviderConfig::Gemini(cfg) => {
                gemini::complete(&self.http, cfg, &self.model, system, transcript, specs).await
            }
            ProviderConfig::OpenAi(cfg) => {
                openai::complete(&self.http, cfg, &self.model, system, transcript, specs).await
            }
            ProviderConfig::Local => Ok(local::respond(transcript, specs)),
        }
    }
}

impl ReasoningService for LlmClient {
    fn invoke(
        &self,
        system: &str,
        conversation: &[ChatMessage],
        tools: &dyn ToolBox,
    ) -> Result<Vec<ChatMessage>, LlmError> {
        let rt = Runtime::new().map_err(LlmError::Runtime)?;
        let specs = tools.specs();
        let mut transcript = conversation.to_vec();
        for step in 0..self.max_steps {
            let reply = rt.block_on(self.complete(system, &transcript, &specs))?;
            let calls = reply.tool_calls.clone();
            transcript.push(reply);
            if calls.is_empty() {
                debug!(
                    provider = self.provider.as_str(),
                    step,
                    messages = transcript.len(),
                    "reasoning finished"
                );
                return Ok(transcript);
            }
            for call in &calls {
                debug!(tool = %call.name, input = %call.input, "running tool");
                let output = tools.call(&call.name, &call.input);
                transcript.push(ChatMessage::tool_result(call, output));
            }
        }
        warn!(
            provider = self.provider.as_str(),
            max_steps = self.max_steps,
            "tool loop stopped before a final answer"
        );
        Ok(transcript)
    }
}

/// Sends a request and decodes the JSON body. HTTP 429 is reported as `RateLimited`
/// so callers can classify it without looking at the text.
pub(crate) async fn send_json(
    provider: &'static str,
    request: RequestBuilder,
) -> Result<Value, LlmError> {
    let response = request
        .send()
        .await
        .map_err(|source| LlmError::Transport { provider, source })?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(LlmError::RateLimited { provider, body });
    }
    if !status.is_success() {
        return Err(LlmError::Status {
            provider,
            status: status.as_u16(),
            body,
        });
    }
    serde_json::from_str(&body).map_err(|err| LlmError::Decode {
        provider,
        message: err.to_string(),
    })
}

fn read_api_key(vars: &[&'static str]) -> Result<String, LlmError> {
    for var in vars {
        if let Ok(value) = env::var(var) {
            let value = value.trim().to_string();
            if value.is_empty() {
                continue;
            }
            validate_api_key(var, &value)?;
            return Ok(value);
        }
    }
    Err(LlmError::MissingApiKey(vars.first().copied().unwrap_or("API key")))
}

fn validate_api_key(var: &'static str, value: &str) -> Result<(), LlmError> {
    if var.contains("OPENAI") && !value.starts_with("sk-") {
        return Err(LlmError::InvalidApiKey {
            var,
            reason: "must start with 'sk-' (see https://platform.openai.com/)".into(),
        });
    }
    if (var.contains("GEMINI") || var.contains("GOOGLE")) && !value.starts_with("AI") {
        return Err(LlmError::InvalidApiKey {
            var,
            reason: "must be a valid Gemini API key (starts with 'AI...')".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct RecordingTools {
        calls: RefCell<Vec<(String, String)>>,
    }

    impl RecordingTools {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ToolBox for RecordingTools {
        fn specs(&self) -> Vec<ToolSpec> {
            vec![
                ToolSpec::new("search_financial_filings", "search all"),
                ToolSpec::new("search_ticker_specific", "search one"),
                ToolSpec::new("compare_companies", "compare two"),
            ]
        }

        fn call(&self, name: &str, input: &str) -> String {
            self.calls
                .borrow_mut()
                .push((name.to_string(), input.to_string()));
            "Data for AAPL:\nrevenue $394.3 billion\n\nData for MSFT:\nrevenue $198.3 billion".into()
        }
    }

    #[test]
    fn provider_names_round_trip() {
        for provider in [LlmProvider::Gemini, LlmProvider::OpenAi, LlmProvider::Local] {
            assert_eq!(LlmProvider::from_str(provider.as_str()), Some(provider));
        }
        assert_eq!(LlmProvider::from_str("Google"), Some(LlmProvider::Gemini));
        assert_eq!(LlmProvider::from_str("anthropic"), None);
    }

    #[test]
    fn api_keys_are_validated_by_prefix() {
        assert!(validate_api_key("OPENAI_API_KEY", "sk-test").is_ok());
        assert!(validate_api_key("OPENAI_API_KEY", "test").is_err());
        assert!(validate_api_key("GEMINI_API_KEY", "AIzaSy").is_ok());
        assert!(validate_api_key("GOOGLE_AI_STUDIO_API_KEY", "nope").is_err());
    }

    #[test]
    fn local_client_runs_one_tool_round_then_answers() {
        let client = LlmClient::local();
        let tools = RecordingTools::new();
        let conversation = vec![ChatMessage::user("Compare Apple and Microsoft revenue")];
        let transcript = client
            .invoke("system", &conversation, &tools)
            .expect("local invoke");

        let calls = tools.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "compare_companies");
        assert!(calls[0].1.starts_with("ticker1:AAPL ticker2:MSFT query:"));

        assert_eq!(transcript.len(), 4);
        assert_eq!(transcript[0].role, Role::User);
        assert_eq!(transcript[1].role, Role::Assistant);
        assert_eq!(transcript[2].role, Role::Tool);
        let last = transcript.last().expect("answer");
        assert_eq!(last.role, Role::Assistant);
        assert!(last.text().contains("AAPL"));
        assert!(last.text().contains("MSFT"));
    }

    #[test]
    fn step_budget_bounds_the_loop() {
        struct Echo;
        impl ToolBox for Echo {
            fn specs(&self) -> Vec<ToolSpec> {
                vec![ToolSpec::new("search_financial_filings", "search all")]
            }
            fn call(&self, _name: &str, _input: &str) -> String {
                "context".into()
            }
        }
        let client = LlmClient::local().with_max_steps(1);
        let transcript = client
            .invoke("system", &[ChatMessage::user("What is revenue?")], &Echo)
            .expect("local invoke");
        // one assistant tool call plus its result, no final answer
        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript.last().map(|m| m.role), Some(Role::Tool));
    }
}
