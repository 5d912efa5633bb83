//! Keyword tooling shared by lexical scoring, routing, and deduplication
//!
//! One tokenizer for everything: lowercased alphanumeric runs. The lexical
//! retrieval signal is normalized token overlap against the query; FTS5 is
//! used only for candidate fetch, with queries sanitized term by term.

use std::collections::HashSet;

/// Split text into lowercased alphanumeric tokens
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Token set of a text, for overlap computations
pub fn token_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Sanitize a user query for FTS5 MATCH syntax
///
/// Wraps each whitespace-delimited word in double quotes and joins with OR so
/// any term produces a candidate; scoring happens afterwards in Rust. Strips
/// embedded quotes so user input cannot alter the MATCH grammar.
pub fn sanitize_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| {
            let clean: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
            format!("\"{clean}\"")
        })
        .filter(|w| w != "\"\"")
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Normalized token overlap of content against a query, in [0, 1]
///
/// `|query_tokens ∩ content_tokens| / |query_tokens|` over unique tokens.
pub fn overlap_score(query_tokens: &HashSet<String>, content: &str) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let content_tokens = token_set(content);
    let hits = query_tokens
        .iter()
        .filter(|t| content_tokens.contains(*t))
        .count();
    hits as f64 / query_tokens.len() as f64
}

/// Jaccard similarity of two token sets, in [0, 1]
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Common English tokens excluded from topic grouping and entity extraction
pub const STOPWORDS: &[&str] = &[
    "a", "an", "the", "in", "on", "at", "of", "to", "for", "and", "or", "but",
    "is", "are", "was", "were", "be", "been", "it", "its", "this", "that",
    "with", "from", "by", "as", "has", "have", "had", "not", "no", "we", "i",
    "you", "they", "he", "she", "his", "her", "our", "their", "my", "me",
];

/// Whether a token carries topical signal
pub fn is_topical(token: &str) -> bool {
    token.len() >= 3 && !STOPWORDS.contains(&token)
}

// ============================================================================
// TESTS
// ============================================================================
