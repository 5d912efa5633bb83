//! Search Module
//!
//! Retrieval machinery:
//! - Vector search over an HNSW index (USearch)
//! - Keyword tooling: tokenizer, FTS5 sanitizing, overlap scoring
//! - Hybrid retrieval composing vector, lexical, graph, and recency signals
//! - Query routing: intent classification and the temporal redirect

mod hybrid;
mod keyword;
mod router;
mod vector;

pub use vector::{
    RebuildOutcome, VectorIndex, VectorIndexConfig, VectorIndexError, VectorIndexStats,
};

pub use keyword::{
    is_topical, jaccard, overlap_score, sanitize_fts5_query, token_set, tokenize, STOPWORDS,
};

pub use hybrid::{
    Hit, RetrievalFilters, RetrievalOutcome, Retriever, SignalBreakdown, SignalWeights,
};

pub use router::{
    QueryIntent, QueryRouter, RetrievalPlan, TemporalRedirect, DEFAULT_CONFIDENCE_FLOOR,
};
