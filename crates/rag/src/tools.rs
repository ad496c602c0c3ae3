use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use finrag_llm::{ToolBox, ToolSpec};

use crate::retrieval::FilingRetriever;

const QUERY_MARKER: &str = "query:";
const TICKER_PREFIX: &str = "ticker:";

static TICKER_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:^|\s)[a-z0-9_]*ticker[a-z0-9_]*:(\S+)").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    SearchAll,
    SearchTicker,
    CompareTickers,
}

impl ToolKind {
    pub const ALL: [ToolKind; 3] = [
        ToolKind::SearchAll,
        ToolKind::SearchTicker,
        ToolKind::CompareTickers,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::SearchAll => "search_financial_filings",
            ToolKind::SearchTicker => "search_ticker_specific",
            ToolKind::CompareTickers => "compare_companies",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name.trim())
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolKind::SearchAll => concat!(
                "Search across all indexed SEC 10-K financial filings for information. ",
                "Use this for general financial queries or when no specific company is mentioned. ",
                "Input: A natural language query about financial data (e.g., 'revenue', 'profit', 'expenses'). ",
                "Returns: Relevant excerpts from 10-K filings with company names and dates."
            ),
            ToolKind::SearchTicker => concat!(
                "Search filings for a SPECIFIC company using its ticker symbol. ",
                "Use this when the query mentions a specific company name or you need data for one company. ",
                "Input format: 'ticker:SYMBOL query:your question' (e.g., 'ticker:AAPL query:revenue in 2022'). ",
                "Common tickers: AAPL (Apple), MSFT (Microsoft), GOOGL (Google), AMZN (Amazon). ",
                "Returns: Company-specific financial information from their 10-K filings."
            ),
            ToolKind::CompareTickers => concat!(
                "Compare financial data between TWO companies. ",
                "Use this when the query asks to compare, contrast, or show differences between companies. ",
                "Input format: 'ticker1:SYMBOL1 ticker2:SYMBOL2 query:what to compare' ",
                "(e.g., 'ticker1:AAPL ticker2:MSFT query:revenue comparison in 2022'). ",
                "Returns: Side-by-side financial data for both companies."
            ),
        }
    }

    fn no_documents_message(&self) -> &'static str {
        match self {
            ToolKind::CompareTickers => "No documents available. Please fetch and index SEC 10-K filings first before comparing companies.",
            _ => "No documents available. Please fetch and index SEC 10-K filings first before querying.",
        }
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec::new(self.name(), self.description())
    }
}

/// A tool request after its free-text input has been parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolInvocation {
    SearchAll {
        query: String,
    },
    SearchTicker {
        ticker: String,
        query: String,
    },
    CompareTickers {
        ticker: String,
        ticker2: String,
        query: String,
    },
}

/// Malformed tool input. The message is handed back to the model as the tool output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolParseError {
    #[error("Invalid format. Use 'ticker:AAPL query:your question'")]
    InvalidTickerFormat,
    #[error("Invalid format. Expected 'ticker1:AAPL ticker2:MSFT query:revenue comparison'")]
    InvalidCompareFormat,
    #[error("Need at least two tickers to compare. Format: 'ticker1:AAPL ticker2:MSFT query:your question'")]
    NeedTwoTickers,
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

impl ToolInvocation {
    pub fn parse(kind: ToolKind, input: &str) -> Result<Self, ToolParseError> {
        match kind {
            ToolKind::SearchAll => Ok(ToolInvocation::SearchAll {
                query: input.trim().to_string(),
            }),
            ToolKind::SearchTicker => {
                let (head, query) =
                    split_query(input).ok_or(ToolParseError::InvalidTickerFormat)?;
                let ticker = head.replace(TICKER_PREFIX, "");
                let ticker = ticker.trim();
                if ticker.is_empty() {
                    return Err(ToolParseError::InvalidTickerFormat);
                }
                Ok(ToolInvocation::SearchTicker {
                    ticker: ticker.to_string(),
                    query: query.to_string(),
                })
            }
            ToolKind::CompareTickers => {
                let (_, query) = split_query(input).ok_or(ToolParseError::InvalidCompareFormat)?;
                let tickers: Vec<&str> = TICKER_TOKEN
                    .captures_iter(input)
                    .filter_map(|caps| caps.get(1))
                    .map(|m| m.as_str())
                    .collect();
                match tickers.as_slice() {
                    [first, second, ..] => Ok(ToolInvocation::CompareTickers {
                        ticker: first.to_string(),
                        ticker2: second.to_string(),
                        query: query.to_string(),
                    }),
                    _ => Err(ToolParseError::NeedTwoTickers),
                }
            }
        }
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            ToolInvocation::SearchAll { .. } => ToolKind::SearchAll,
            ToolInvocation::SearchTicker { .. } => ToolKind::SearchTicker,
            ToolInvocation::CompareTickers { .. } => ToolKind::CompareTickers,
        }
    }
}

/// Splits at the first `query:` marker into (text before, trimmed query).
fn split_query(input: &str) -> Option<(&str, &str)> {
    let idx = input.find(QUERY_MARKER)?;
    let query = input[idx + QUERY_MARKER.len()..].trim();
    Some((&input[..idx], query))
}

/// The three retrieval tools, answering from a [`FilingRetriever`].
pub struct FilingTools<'a> {
    retriever: &'a FilingRetriever,
    tool_k: usize,
    compare_k: usize,
}

impl<'a> FilingTools<'a> {
    pub fn new(retriever: &'a FilingRetriever, tool_k: usize, compare_k: usize) -> Self {
        Self {
            retriever,
            tool_k: tool_k.max(1),
            compare_k: compare_k.max(1),
        }
    }

    pub fn run(&self, kind: ToolKind, input: &str) -> String {
        if !self.retriever.has_documents() {
            return kind.no_documents_message().to_string();
        }
        match ToolInvocation::parse(kind, input) {
            Ok(invocation) => self.execute(&invocation),
            Err(err) => {
                warn!(tool = kind.name(), input, error = %err, "malformed tool input");
                err.to_string()
            }
        }
    }

    pub fn execute(&self, invocation: &ToolInvocation) -> String {
        debug!(?invocation, "executing tool");
        match invocation {
            ToolInvocation::SearchAll { query } => {
                self.retriever.get_context_for_query(query, Some(self.tool_k))
            }
            ToolInvocation::SearchTicker { ticker, query } => {
                let results = self.retriever.search_by_ticker(query, ticker, Some(self.tool_k));
                if results.is_empty() {
                    return format!(
                        "No information found for {ticker}. Ensure this company's filings are indexed."
                    );
                }
                results
                    .iter()
                    .map(|r| r.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n")
            }
            ToolInvocation::CompareTickers {
                ticker,
                ticker2,
                query,
            } => {
                let first = self.retriever.search_by_ticker(query, ticker, Some(self.compare_k));
                let second = self.retriever.search_by_ticker(query, ticker2, Some(self.compare_k));
                match (first.is_empty(), second.is_empty()) {
                    (true, true) => format!(
                        "No information found for {ticker} or {ticker2}. Ensure these companies' filings are indexed."
                    ),
                    (true, false) => format!(
                        "No information found for {ticker}. Only {ticker2} data is available."
                    ),
                    (false, true) => format!(
                        "No information found for {ticker2}. Only {ticker} data is available."
                    ),
                    (false, false) => {
                        let join = |results: &[crate::store::RetrievalResult]| {
                            results
                                .iter()
                                .map(|r| r.content.as_str())
                                .collect::<Vec<_>>()
                                .join("\n")
                        };
                        format!(
                            "Data for {ticker}:\n{}\n\nData for {ticker2}:\n{}",
                            join(&first),
                            join(&second)
                        )
                    }
                }
            }
        }
    }
}

impl ToolBox for FilingTools<'_> {
    fn specs(&self) -> Vec<ToolSpec> {
        ToolKind::ALL.iter().map(ToolKind::spec).collect()
    }

    fn call(&self, name: &str, input: &str) -> String {
        match ToolKind::from_name(name) {
            Some(kind) => self.run(kind, input),
            None => {
                warn!(tool = name, "model requested an unknown tool");
                ToolParseError::UnknownTool(name.to_string()).to_string()
            }
        }
    }
}
