//! Query router
//!
//! Classifies a raw query string into an intent and a retrieval plan using
//! token and pattern rules only; no model in the loop. Temporal queries are
//! rewritten into a chronological listing (the "temporal redirect") instead
//! of similarity search.

use serde::Serialize;

use crate::engram::Category;
use crate::search::hybrid::SignalWeights;
use crate::search::keyword::tokenize;
use crate::storage::SortKey;

/// Confidence below which the router falls back to balanced semantic retrieval
pub const DEFAULT_CONFIDENCE_FLOOR: f64 = 0.4;

/// Markers that flag a chronology question rather than a similarity one
const TEMPORAL_MARKERS: &[&str] = &[
    "latest", "newest", "recent", "recently", "yesterday", "today", "tonight",
    "current", "currently", "ago", "earlier", "last",
];

/// Leading phrases that flag an aggregation question
const AGGREGATIVE_PREFIXES: &[&str] = &["how many", "count ", "number of", "total ", "list all", "all "];

/// Query intent classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    /// Open-ended meaning query (default)
    Semantic,
    /// Exact terms, identifiers, quoted substrings
    Lexical,
    /// Chronology question, served by a listing instead
    Temporal,
    /// Counting / statistics question
    Aggregative,
}

impl QueryIntent {
    /// String representation used in search responses
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::Semantic => "semantic",
            QueryIntent::Lexical => "lexical",
            QueryIntent::Temporal => "temporal",
            QueryIntent::Aggregative => "aggregative",
        }
    }
}

/// Redirect of a temporal query to a chronological listing
#[derive(Debug, Clone)]
pub struct TemporalRedirect {
    /// Sort order for the listing
    pub sort: SortKey,
    /// Page size
    pub limit: usize,
    /// Category filter detected in the query, if any
    pub category: Option<Category>,
}

/// A classified query with everything retrieval needs
#[derive(Debug, Clone)]
pub struct RetrievalPlan {
    /// Detected intent
    pub intent: QueryIntent,
    /// Confidence in the classification (0.0 to 1.0)
    pub confidence: f64,
    /// Signal weights retrieval should use
    pub weights: SignalWeights,
    /// Result count
    pub k: usize,
    /// Category filter detected in the query
    pub category: Option<Category>,
    /// Present when the query should be served by a listing
    pub redirect: Option<TemporalRedirect>,
    /// Hint that aggregate statistics answer this better than content
    pub stats_hint: bool,
    /// Matched rules, for telemetry
    pub evidence: Vec<String>,
}

/// Token- and pattern-rule query classifier
#[derive(Debug, Clone)]
pub struct QueryRouter {
    confidence_floor: f64,
}

impl Default for QueryRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryRouter {
    /// Create with the default confidence floor
    pub fn new() -> Self {
        Self {
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
        }
    }

    /// Create with a custom confidence floor
    pub fn with_confidence_floor(confidence_floor: f64) -> Self {
        Self { confidence_floor }
    }

    /// Classify a query into a retrieval plan
    pub fn classify(&self, query: &str, k: usize) -> RetrievalPlan {
        let lower = query.to_lowercase();
        let tokens = tokenize(query);
        let mut evidence = Vec::new();

        let temporal_score = self.score_temporal(&lower, &tokens, &mut evidence);
        let lexical_score = self.score_lexical(query, &tokens, &mut evidence);
        let aggregative_score = self.score_aggregative(&lower, &mut evidence);
        let category = detect_category(&tokens);
        if let Some(c) = &category {
            evidence.push(format!("category:{c}"));
        }

        let (intent, confidence) = [
            (QueryIntent::Temporal, temporal_score),
            (QueryIntent::Lexical, lexical_score),
            (QueryIntent::Aggregative, aggregative_score),
        ]
        .into_iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .filter(|(_, score)| *score >= self.confidence_floor)
        .unwrap_or((QueryIntent::Semantic, semantic_confidence(&tokens)));

        let weights = match intent {
            QueryIntent::Semantic | QueryIntent::Aggregative => SignalWeights::default(),
            QueryIntent::Lexical => SignalWeights {
                vector: 0.20,
                lexical: 0.60,
                graph: 0.10,
                recency: 0.10,
            },
            QueryIntent::Temporal => SignalWeights {
                vector: 0.40,
                lexical: 0.15,
                graph: 0.05,
                recency: 0.40,
            },
        };

        let redirect = if intent == QueryIntent::Temporal {
            Some(TemporalRedirect {
                sort: SortKey::Recent,
                limit: k,
                category: category.clone(),
            })
        } else {
            None
        };

        RetrievalPlan {
            intent,
            confidence,
            weights,
            k,
            category,
            redirect,
            stats_hint: intent == QueryIntent::Aggregative,
            evidence,
        }
    }

    fn score_temporal(&self, lower: &str, tokens: &[String], evidence: &mut Vec<String>) -> f64 {
        let mut score: f64 = 0.0;
        for marker in TEMPORAL_MARKERS {
            if tokens.iter().any(|t| t == marker) {
                score += 0.45;
                evidence.push(format!("temporal:{marker}"));
            }
        }
        for phrase in ["last week", "last month", "last year", "this week", "this month"] {
            if lower.contains(phrase) {
                score += 0.45;
                evidence.push(format!("temporal:{phrase}"));
            }
        }
        // A bare 4-digit year or a dashed/slashed date
        if tokens.iter().any(|t| t.len() == 4 && t.chars().all(|c| c.is_ascii_digit())) {
            score += 0.45;
            evidence.push("temporal:year".to_string());
        }
        if lower.chars().filter(|c| *c == '-' || *c == '/').count() >= 2
            && tokens.iter().filter(|t| t.chars().all(|c| c.is_ascii_digit())).count() >= 3
        {
            score += 0.45;
            evidence.push("temporal:date".to_string());
        }
        score.min(1.0)
    }

    fn score_lexical(&self, raw: &str, tokens: &[String], evidence: &mut Vec<String>) -> f64 {
        let mut score: f64 = 0.0;
        if raw.matches('"').count() >= 2 || raw.matches('\'').count() >= 2 {
            score += 0.7;
            evidence.push("lexical:quoted".to_string());
        }
        let identifier_like = raw
            .split_whitespace()
            .filter(|w| {
                w.contains("::")
                    || w.contains('_')
                    || w.contains("()")
                    || w.contains('/')
                    || is_camel_case(w)
            })
            .count();
        let words = raw.split_whitespace().count().max(1);
        if identifier_like * 2 > words {
            score += 0.6;
            evidence.push("lexical:identifiers".to_string());
        }
        if tokens.len() == 1 {
            score += 0.2;
        }
        score.min(1.0)
    }

    fn score_aggregative(&self, lower: &str, evidence: &mut Vec<String>) -> f64 {
        for prefix in AGGREGATIVE_PREFIXES {
            if lower.starts_with(prefix) {
                evidence.push(format!("aggregative:{}", prefix.trim()));
                return 0.7;
            }
        }
        if lower.contains("how many") || lower.ends_with(" count") {
            evidence.push("aggregative:count".to_string());
            return 0.6;
        }
        0.0
    }
}

/// Confidence of the semantic fallback: longer natural queries are surer
fn semantic_confidence(tokens: &[String]) -> f64 {
    match tokens.len() {
        0 => 0.0,
        1 => 0.3,
        2 => 0.5,
        _ => 0.7,
    }
}

fn is_camel_case(word: &str) -> bool {
    let has_lower = word.chars().any(|c| c.is_ascii_lowercase());
    let interior_upper = word.chars().skip(1).any(|c| c.is_ascii_uppercase());
    has_lower && interior_upper
}

/// Detect a built-in category name mentioned in the query
fn detect_category(tokens: &[String]) -> Option<Category> {
    for token in tokens {
        let singular = token.strip_suffix('s').unwrap_or(token);
        match singular {
            "fact" => return Some(Category::Fact),
            "observation" => return Some(Category::Observation),
            "action" => return Some(Category::Action),
            "plan" => return Some(Category::Plan),
            "synthesis" | "syntheses" => return Some(Category::Synthesis),
            _ => {}
        }
    }
    None
}

// ============================================================================
// TESTS
// ============================================================================
