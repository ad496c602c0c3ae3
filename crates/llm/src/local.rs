//! Deterministic offline stand-in for a tool-calling model.
//!
//! The router reads the latest user question, picks one tool from the company names and
//! tickers it mentions, and once tool output is in the transcript answers with it.

use finrag_core::strip_annotation;

use crate::message::{ChatMessage, Role, ToolCall};
use crate::tool::ToolSpec;

const COMPANIES: [(&str, &str); 9] = [
    ("apple", "AAPL"),
    ("microsoft", "MSFT"),
    ("google", "GOOGL"),
    ("alphabet", "GOOGL"),
    ("amazon", "AMZN"),
    ("tesla", "TSLA"),
    ("meta", "META"),
    ("facebook", "META"),
    ("nvidia", "NVDA"),
];

const SEARCH_ALL: &str = "search_financial_filings";
const SEARCH_TICKER: &str = "search_ticker_specific";
const COMPARE: &str = "compare_companies";

pub(crate) fn respond(transcript: &[ChatMessage], specs: &[ToolSpec]) -> ChatMessage {
    let trailing_results: Vec<&ChatMessage> = transcript
        .iter()
        .rev()
        .take_while(|message| message.role == Role::Tool)
        .collect();
    if !trailing_results.is_empty() {
        return compose_answer(trailing_results.into_iter().rev());
    }

    let question = transcript
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .map(ChatMessage::text)
        .unwrap_or_default();
    let question = strip_annotation(&question);
    if question.is_empty() {
        return ChatMessage::assistant("Please ask a question about the indexed filings.");
    }

    let tickers = detect_tickers(question);
    let (tool, input) = match tickers.as_slice() {
        [first, second, ..] => (
            COMPARE,
            format!("ticker1:{first} ticker2:{second} query:{question}"),
        ),
        [only] => (SEARCH_TICKER, format!("ticker:{only} query:{question}")),
        [] => (SEARCH_ALL, question.to_string()),
    };
    if !specs.iter().any(|spec| spec.name == tool) {
        return ChatMessage::assistant(format!(
            "No retrieval tool is available to answer: {question}"
        ));
    }
    let call = ToolCall {
        id: format!("local-call-{}", transcript.len()),
        name: tool.to_string(),
        input,
    };
    ChatMessage::assistant(String::new()).with_tool_calls(vec![call])
}

fn compose_answer<'a>(results: impl Iterator<Item = &'a ChatMessage>) -> ChatMessage {
    let mut tools = Vec::new();
    let mut bodies = Vec::new();
    for message in results {
        if let Some(name) = &message.name {
            if !tools.contains(name) {
                tools.push(name.clone());
            }
        }
        let text = message.text();
        if !text.trim().is_empty() {
            bodies.push(text.trim().to_string());
        }
    }
    if bodies.is_empty() {
        return ChatMessage::assistant(
            "The filings search returned nothing relevant to this question.",
        );
    }
    ChatMessage::assistant(format!(
        "Based on the indexed filings ({}):\n\n{}",
        tools.join(", "),
        bodies.join("\n\n")
    ))
}

/// Tickers named in `text`, in order of first mention.
fn detect_tickers(text: &str) -> Vec<&'static str> {
    let mut found = Vec::new();
    for token in text.split(|c: char| !c.is_ascii_alphanumeric()) {
        if token.is_empty() {
            continue;
        }
        let lower = token.to_lowercase();
        let upper = token.to_uppercase();
        let ticker = COMPANIES
            .iter()
            .find(|(name, ticker)| *name == lower || (token.len() > 1 && *ticker == upper))
            .map(|(_, ticker)| *ticker);
        if let Some(ticker) = ticker {
            if !found.contains(&ticker) {
                found.push(ticker);
            }
        }
    }
    found
}
