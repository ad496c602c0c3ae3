use once_cell::sync::Lazy;
use regex::Regex;

/// Start of the hint annotation appended to a question.
pub const ANNOTATION_MARKER: &str = " [context: ";

static COMPARISON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(compare[sd]?|comparison|comparing|versus|vs\.?|difference|differences|better|contrast)\b")
        .expect("valid regex")
});
static ANNUAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(fiscal year|fy\d{0,4}|annual|(19|20)\d{2})\b").expect("valid regex"));
static QUARTERLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(quarter|quarterly|q[1-4])\b").expect("valid regex"));

const METRICS: [(&[&str], &str); 6] = [
    (&["revenue", "sales"], "revenue"),
    (&["profit", "income", "earnings"], "net income"),
    (&["expense", "cost"], "expenses"),
    (&["margin"], "profit margins"),
    (&["asset"], "assets"),
    (&["liabilit", "debt"], "liabilities"),
];

/// Appends keyword-derived hints to `question` without touching its text.
///
/// A question already carrying the annotation this function would add is returned
/// as is, so enhancing twice gives the same result as enhancing once. Bracketed
/// text written by the user is part of the question and is never removed.
pub fn enhance_query(question: &str) -> String {
    let trimmed = question.trim();
    if annotated_base(trimmed).is_some() {
        return trimmed.to_string();
    }
    annotate(trimmed)
}

/// The question without a trailing annotation produced by [`enhance_query`].
pub fn strip_annotation(question: &str) -> &str {
    let trimmed = question.trim();
    annotated_base(trimmed).unwrap_or(trimmed)
}

fn annotate(base: &str) -> String {
    let hints = hints_for(base);
    if hints.is_empty() {
        return base.to_string();
    }
    format!("{base}{ANNOTATION_MARKER}{}]", hints.join("; "))
}

// Base question when `text` ends with exactly the annotation computed from that base.
fn annotated_base(text: &str) -> Option<&str> {
    if !text.ends_with(']') {
        return None;
    }
    let idx = text.rfind(ANNOTATION_MARKER)?;
    let base = &text[..idx];
    (annotate(base) == text).then_some(base)
}

fn hints_for(question: &str) -> Vec<String> {
    let lower = question.to_lowercase();
    let mut hints = Vec::new();
    if COMPARISON.is_match(&lower) {
        hints.push("comparison question".to_string());
    }
    let metrics: Vec<&str> = METRICS
        .iter()
        .filter(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(_, label)| *label)
        .collect();
    if !metrics.is_empty() {
        hints.push(format!("metrics: {}", metrics.join(", ")));
    }
    if ANNUAL.is_match(&lower) {
        hints.push("annual fiscal year data".to_string());
    } else if QUARTERLY.is_match(&lower) {
        hints.push("quarterly data".to_string());
    }
    hints
}
