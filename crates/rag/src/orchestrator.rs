use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use finrag_core::enhance_query;
use finrag_llm::{ChatMessage, LlmError, ReasoningService, Role};

use crate::clock::Clock;
use crate::config::AgentConfig;
use crate::retrieval::FilingRetriever;
use crate::tools::FilingTools;

pub const EMPTY_QUESTION: &str = "Please provide a valid query.";
pub const NO_DOCUMENTS: &str = "No documents available in the system. Please fetch and index SEC 10-K filings first before asking questions.";
pub const NO_ANSWER: &str = "I processed your query but couldn't generate a response. Please try rephrasing your question. Helpful tip: Include the company name or ticker symbol (e.g., 'Apple' or 'AAPL') and specific metric (e.g., 'revenue', 'net income') in your query.";
pub const RATE_LIMITED: &str = "The AI service is currently rate-limited. This is common with free-tier quotas when making multiple requests. Please wait 2-3 minutes before trying again. Consider simplifying your query to use fewer API calls.";

pub const SYSTEM_PROMPT: &str = r#"You are a financial analyst assistant specializing in SEC 10-K filings analysis. When answering questions:

1. **Use the Tools**: Always use the available tools to search SEC 10-K filings for relevant information.
   - Use 'search_financial_filings' for general queries
   - Use 'search_ticker_specific' when the query is about a specific company
   - Use 'compare_companies' when comparing two companies

2. **Extract Key Information**: After gathering information, identify:
   - Specific financial figures (revenue, income, expenses, etc.)
   - Time periods (fiscal year, quarter)
   - Companies mentioned (ticker symbols)
   - Percentage changes or growth rates

3. **Provide Clear Answers**:
   - Answer directly with specific numbers and dates
   - Include context (e.g., "Apple's revenue in fiscal year 2022 was $394.3 billion")
   - Cite the source company and filing date when available
   - Use clear formatting (bullet points for multiple facts)

4. **Handle Missing Information**:
   - If information is not found, explicitly state what is missing
   - Suggest alternative queries or companies that might have relevant data
   - Never make up financial data

5. **Always Provide a Final Answer**:
   - After using tools, always synthesize the information into a clear, final response
   - Do not just return raw search results

Remember: Users expect precise financial data with proper attribution to source documents."#;

/// A question turned away before the reasoning service is contacted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{}", EMPTY_QUESTION)]
    EmptyQuestion,
    #[error("{}", NO_DOCUMENTS)]
    NoDocuments,
}

fn fatal_message(err: &LlmError) -> String {
    format!(
        "Error processing query: {err}. Please ensure your question includes specific company names and financial metrics."
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_wait: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Wait after the zero-based failed `attempt`: `base_wait * 2^attempt`.
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31) as u32);
        self.base_wait.saturating_mul(factor)
    }
}

/// Keeps calls to the reasoning service at least `min_spacing` apart.
pub struct Pacer {
    clock: Arc<dyn Clock>,
    min_spacing: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(clock: Arc<dyn Clock>, min_spacing: Duration) -> Self {
        Self {
            clock,
            min_spacing,
            last_call: Mutex::new(None),
        }
    }

    pub fn remaining_wait(&self, now: Instant) -> Duration {
        match *self.last_call.lock() {
            Some(last) => self
                .min_spacing
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    /// Sleeps out the remaining spacing, then marks now as the last call and returns it.
    pub fn wait_turn(&self) -> Instant {
        let wait = self.remaining_wait(self.clock.now());
        if !wait.is_zero() {
            info!(wait_ms = wait.as_millis() as u64, "pacing before reasoning call");
            self.clock.sleep(wait);
        }
        let now = self.clock.now();
        *self.last_call.lock() = Some(now);
        now
    }
}

/// Attempt bookkeeping for one `query` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryState {
    pub attempt: usize,
    pub last_call: Option<Instant>,
}

impl RetryState {
    pub fn since_last_call(&self, now: Instant) -> Duration {
        self.last_call
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or_default()
    }
}

/// Answers questions by running the reasoning service over the retrieval tools.
pub struct QueryOrchestrator {
    retriever: FilingRetriever,
    service: Arc<dyn ReasoningService>,
    clock: Arc<dyn Clock>,
    pacer: Pacer,
    policy: RetryPolicy,
    tool_k: usize,
    compare_k: usize,
    enhance: bool,
}

impl QueryOrchestrator {
    pub fn new(
        retriever: FilingRetriever,
        service: Arc<dyn ReasoningService>,
        clock: Arc<dyn Clock>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            retriever,
            service,
            pacer: Pacer::new(clock.clone(), config.min_call_spacing()),
            clock,
            policy: RetryPolicy {
                max_retries: config.max_retries.max(1),
                base_wait: config.base_wait(),
            },
            tool_k: config.tool_k,
            compare_k: config.compare_k,
            enhance: config.enhance_queries,
        }
    }

    pub fn retriever(&self) -> &FilingRetriever {
        &self.retriever
    }

    pub fn validate<'q>(&self, question: &'q str) -> Result<&'q str, ValidationError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ValidationError::EmptyQuestion);
        }
        if !self.retriever.has_documents() {
            return Err(ValidationError::NoDocuments);
        }
        Ok(question)
    }

    /// Always returns user-facing text; failures are rendered, never raised.
    pub fn query(&self, question: &str) -> String {
        let question = match self.validate(question) {
            Ok(question) => question,
            Err(rejected) => {
                warn!(reason = ?rejected, "question rejected");
                return rejected.to_string();
            }
        };
        let prompt = if self.enhance {
            enhance_query(question)
        } else {
            question.to_string()
        };
        debug!(question, enhanced = %prompt, "prepared query");

        let conversation = vec![ChatMessage::user(prompt)];
        let tools = FilingTools::new(&self.retriever, self.tool_k, self.compare_k);
        let mut state = RetryState::default();
        while state.attempt < self.policy.max_retries {
            state.last_call = Some(self.pacer.wait_turn());
            info!(
                attempt = state.attempt + 1,
                max_retries = self.policy.max_retries,
                "processing query"
            );
            match self.service.invoke(SYSTEM_PROMPT, &conversation, &tools) {
                Ok(messages) => {
                    debug!(
                        messages = messages.len(),
                        call_ms = state.since_last_call(self.clock.now()).as_millis() as u64,
                        "received transcript"
                    );
                    return match extract_answer(&messages) {
                        Some(answer) => {
                            info!(chars = answer.chars().count(), "returning answer");
                            answer
                        }
                        None => {
                            warn!("no assistant message with content in transcript");
                            NO_ANSWER.to_string()
                        }
                    };
                }
                Err(err) if err.is_quota() => {
                    warn!(
                        attempt = state.attempt + 1,
                        max_retries = self.policy.max_retries,
                        call_ms = state.since_last_call(self.clock.now()).as_millis() as u64,
                        error = %err,
                        "reasoning service rate limited"
                    );
                    if state.attempt + 1 < self.policy.max_retries {
                        let wait = self.policy.backoff_delay(state.attempt);
                        warn!(wait_secs = wait.as_secs(), "backing off before retry");
                        self.clock.sleep(wait);
                    }
                    state.attempt += 1;
                }
                Err(err) => {
                    error!(error = %err, "reasoning service failed");
                    return fatal_message(&err);
                }
            }
        }
        warn!(attempts = state.attempt, "retries exhausted");
        RATE_LIMITED.to_string()
    }
}

/// The newest assistant message with non-blank content, normalized to text.
pub fn extract_answer(messages: &[ChatMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .filter(|message| message.role == Role::Assistant)
        .find(|message| !message.content.is_blank())
        .map(|message| message.content.normalized())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RagConfig;
    use crate::testing::ScriptedEmbedder;
    use finrag_core::Document;
    use finrag_llm::{ContentPart, MessageContent, TextFragment, ToolBox};
    use serde_json::json;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    struct ScriptedService {
        replies: Mutex<VecDeque<Result<Vec<ChatMessage>, LlmError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedService {
        fn new(replies: Vec<Result<Vec<ChatMessage>, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().len()
        }
    }

    impl ReasoningService for ScriptedService {
        fn invoke(
            &self,
            _system: &str,
            conversation: &[ChatMessage],
            _tools: &dyn ToolBox,
        ) -> Result<Vec<ChatMessage>, LlmError> {
            self.prompts
                .lock()
                .push(conversation.last().map(ChatMessage::text).unwrap_or_default());
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Other("script exhausted".into())))
        }
    }

    fn rate_limited() -> Result<Vec<ChatMessage>, LlmError> {
        Err(LlmError::RateLimited {
            provider: "gemini",
            body: "quota".into(),
        })
    }

    fn answered(text: &str) -> Result<Vec<ChatMessage>, LlmError> {
        Ok(vec![ChatMessage::user("q"), ChatMessage::assistant(text)])
    }

    fn retriever(dir: &TempDir, seed: bool) -> FilingRetriever {
        let mut config = RagConfig::default();
        config.store.db_path = dir.path().join("orch.sqlite").display().to_string();
        let rag = FilingRetriever::from_config(
            &config,
            Arc::new(ScriptedEmbedder::new(32)),
            Arc::new(ManualClock::new()),
        )
        .expect("retriever");
        if seed {
            rag.add_documents(&[Document::new(
                "Apple revenue was $394.3 billion.",
                "AAPL",
                "2022-10-28",
                "a.txt",
            )])
            .expect("add");
        }
        rag
    }

    fn orchestrator(
        dir: &TempDir,
        seed: bool,
        service: Arc<ScriptedService>,
        clock: Arc<ManualClock>,
    ) -> QueryOrchestrator {
        QueryOrchestrator::new(retriever(dir, seed), service, clock, &AgentConfig::default())
    }

    #[test]
    fn backoff_schedule_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(60));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(120));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(240));
        assert_eq!(policy.backoff_delay(usize::MAX), Duration::from_secs(60) * (1 << 31));
    }

    #[test]
    fn pacing_computes_remaining_spacing() {
        let clock = Arc::new(ManualClock::new());
        let pacer = Pacer::new(clock.clone(), Duration::from_secs(10));
        assert_eq!(pacer.remaining_wait(clock.now()), Duration::ZERO);
        let first = pacer.wait_turn();
        assert_eq!(first, clock.now());
        clock.advance(Duration::from_secs(5));
        assert_eq!(pacer.remaining_wait(clock.now()), Duration::from_secs(5));
        clock.advance(Duration::from_secs(5));
        assert_eq!(pacer.remaining_wait(clock.now()), Duration::ZERO);
        clock.advance(Duration::from_secs(30));
        assert_eq!(pacer.remaining_wait(clock.now()), Duration::ZERO);
    }

    #[test]
    fn retry_state_measures_from_the_paced_call() {
        let clock = Arc::new(ManualClock::new());
        let pacer = Pacer::new(clock.clone(), Duration::from_secs(10));
        let mut state = RetryState::default();
        assert_eq!(state.since_last_call(clock.now()), Duration::ZERO);

        state.last_call = Some(pacer.wait_turn());
        clock.advance(Duration::from_secs(3));
        state.last_call = Some(pacer.wait_turn());
        // the second call only starts once the spacing has elapsed
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(7)]);
        clock.advance(Duration::from_millis(1_500));
        assert_eq!(state.since_last_call(clock.now()), Duration::from_millis(1_500));
    }

    #[test]
    fn empty_question_is_rejected_without_calling_service() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = ScriptedService::new(vec![]);
        let orch = orchestrator(&dir, true, service.clone(), Arc::new(ManualClock::new()));
        assert_eq!(orch.query("   "), EMPTY_QUESTION);
        assert_eq!(orch.validate(""), Err(ValidationError::EmptyQuestion));
        assert_eq!(service.calls(), 0);
    }

    #[test]
    fn missing_documents_are_rejected_without_calling_service() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = ScriptedService::new(vec![answered("x")]);
        let orch = orchestrator(&dir, false, service.clone(), Arc::new(ManualClock::new()));
        assert_eq!(orch.query("What was Apple's revenue?"), NO_DOCUMENTS);
        assert_eq!(orch.validate("revenue"), Err(ValidationError::NoDocuments));
        assert_eq!(service.calls(), 0);
    }

    #[test]
    fn quota_errors_back_off_then_succeed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new());
        let service = ScriptedService::new(vec![rate_limited(), answered("Revenue was $394.3B")]);
        let orch = orchestrator(&dir, true, service.clone(), clock.clone());
        assert_eq!(orch.query("Apple revenue?"), "Revenue was $394.3B");
        assert_eq!(service.calls(), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(60)]);
    }

    #[test]
    fn exhausted_retries_return_rate_limit_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new());
        let service = ScriptedService::new(vec![rate_limited(), rate_limited(), rate_limited()]);
        let orch = orchestrator(&dir, true, service.clone(), clock.clone());
        assert_eq!(orch.query("Apple revenue?"), RATE_LIMITED);
        assert_eq!(service.calls(), 3);
        // no sleep after the final attempt
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(60), Duration::from_secs(120)]
        );
    }

    #[test]
    fn quota_markers_in_error_text_are_retried() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = ScriptedService::new(vec![
            Err(LlmError::Other("429 RESOURCE_EXHAUSTED".into())),
            answered("ok"),
        ]);
        let orch = orchestrator(&dir, true, service.clone(), Arc::new(ManualClock::new()));
        assert_eq!(orch.query("Apple revenue?"), "ok");
        assert_eq!(service.calls(), 2);
    }

    #[test]
    fn fatal_errors_are_surfaced_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new());
        let service = ScriptedService::new(vec![
            Err(LlmError::Status {
                provider: "gemini",
                status: 400,
                body: "invalid argument".into(),
            }),
            answered("never"),
        ]);
        let orch = orchestrator(&dir, true, service.clone(), clock.clone());
        let reply = orch.query("Apple revenue?");
        assert!(reply.starts_with("Error processing query: gemini returned error (status 400)"));
        assert!(reply.ends_with("specific company names and financial metrics."));
        assert_eq!(service.calls(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn consecutive_queries_are_paced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new());
        let service = ScriptedService::new(vec![answered("one"), answered("two")]);
        let orch = orchestrator(&dir, true, service, clock.clone());
        assert_eq!(orch.query("first"), "one");
        clock.advance(Duration::from_secs(4));
        assert_eq!(orch.query("second"), "two");
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(6)]);
    }

    #[test]
    fn question_is_enhanced_unless_disabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = ScriptedService::new(vec![answered("a")]);
        let orch = orchestrator(&dir, true, service.clone(), Arc::new(ManualClock::new()));
        orch.query("Compare Apple revenue");
        assert_eq!(
            service.prompts.lock()[0],
            "Compare Apple revenue [context: comparison question; metrics: revenue]"
        );

        let plain_dir = tempfile::tempdir().expect("tempdir");
        let plain_service = ScriptedService::new(vec![answered("a")]);
        let config = AgentConfig {
            enhance_queries: false,
            ..AgentConfig::default()
        };
        let plain = QueryOrchestrator::new(
            retriever(&plain_dir, true),
            plain_service.clone(),
            Arc::new(ManualClock::new()),
            &config,
        );
        plain.query("  Compare Apple revenue ");
        assert_eq!(plain_service.prompts.lock()[0], "Compare Apple revenue");
    }

    #[test]
    fn user_bracketed_text_reaches_the_service() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = ScriptedService::new(vec![answered("a"), answered("b")]);
        let clock = Arc::new(ManualClock::new());
        let orch = orchestrator(&dir, true, service.clone(), clock.clone());

        orch.query("Summarize Item 7 [context: MD&A section]");
        clock.advance(Duration::from_secs(10));
        orch.query("Apple revenue [context: segment table]");
        let prompts = service.prompts.lock();
        assert_eq!(prompts[0], "Summarize Item 7 [context: MD&A section]");
        assert_eq!(
            prompts[1],
            "Apple revenue [context: segment table] [context: metrics: revenue]"
        );
    }

    #[test]
    fn transcript_without_answer_falls_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = ScriptedService::new(vec![Ok(vec![
            ChatMessage::user("q"),
            ChatMessage::assistant(MessageContent::Empty),
        ])]);
        let orch = orchestrator(&dir, true, service, Arc::new(ManualClock::new()));
        assert_eq!(orch.query("Apple revenue?"), NO_ANSWER);
    }

    #[derive(Debug)]
    struct TextBlock(&'static str);

    impl TextFragment for TextBlock {
        fn text(&self) -> Option<&str> {
            Some(self.0)
        }
    }

    #[test]
    fn extraction_handles_every_content_shape() {
        let plain = vec![ChatMessage::assistant("Revenue was $100B")];
        assert_eq!(extract_answer(&plain).as_deref(), Some("Revenue was $100B"));

        let mut mapping = serde_json::Map::new();
        mapping.insert("text".into(), json!("A "));
        let mixed = vec![ChatMessage::assistant(MessageContent::Parts(vec![
            ContentPart::Mapping(mapping),
            ContentPart::Text("B".into()),
            ContentPart::Fragment(Arc::new(TextBlock("C"))),
        ]))];
        assert_eq!(extract_answer(&mixed).as_deref(), Some("A BC"));

        let from_json = vec![ChatMessage::assistant(MessageContent::from(
            json!([{"text": "A "}, "B"]),
        ))];
        assert_eq!(extract_answer(&from_json).as_deref(), Some("A B"));
    }

    #[test]
    fn extraction_scans_newest_first_and_skips_non_answers() {
        let call = finrag_llm::ToolCall {
            id: "1".into(),
            name: "compare_companies".into(),
            input: String::new(),
        };
        let messages = vec![
            ChatMessage::user("question"),
            ChatMessage::assistant("older answer"),
            ChatMessage::assistant(MessageContent::Empty).with_tool_calls(vec![call.clone()]),
            ChatMessage::tool_result(&call, "tool text is not an answer"),
            ChatMessage::assistant("  "),
        ];
        assert_eq!(extract_answer(&messages).as_deref(), Some("older answer"));
        assert_eq!(extract_answer(&[ChatMessage::user("only a user")]), None);
        assert_eq!(extract_answer(&[]), None);
    }
}
