//! Hybrid retriever
//!
//! Produces a ranked candidate list for a query by combining four signals -
//! vector similarity, lexical overlap, graph connectivity, and recency -
//! scaled by the learned helpfulness multiplier:
//!
//! `score = h * (alpha*v + beta*l + gamma*g + delta*r)`
//!
//! Candidates come from the vector index and FTS5; scoring and post-filters
//! run in process. Vector-index failure degrades to lexical-only rather than
//! erroring, and engrams without embeddings stay reachable lexically.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;

use crate::embeddings::{cosine_similarity, Embedder};
use crate::engram::{Category, Engram};
use crate::error::{EngineError, Result};
use crate::feedback::UsageFeedback;
use crate::graph::KnowledgeGraph;
use crate::search::keyword::{overlap_score, token_set, tokenize};
use crate::search::vector::VectorIndex;
use crate::storage::EngramStore;
use crate::temporal::ValidityQuery;

/// Days over which the recency signal halves roughly every three weeks
const RECENCY_HORIZON_DAYS: f64 = 30.0;

/// Query embeddings cached to avoid re-embedding repeated queries
const QUERY_CACHE_CAPACITY: usize = 100;

/// How many candidates to pull per signal relative to `k`
const CANDIDATE_MULTIPLIER: usize = 3;

/// Signal weights for score composition
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalWeights {
    /// Weight of vector similarity
    pub vector: f64,
    /// Weight of lexical overlap
    pub lexical: f64,
    /// Weight of graph connectivity
    pub graph: f64,
    /// Weight of the recency boost
    pub recency: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            vector: 0.60,
            lexical: 0.20,
            graph: 0.10,
            recency: 0.10,
        }
    }
}

impl SignalWeights {
    /// Override the recency weight (the per-call `recency_boost` knob)
    pub fn with_recency(mut self, recency: f64) -> Self {
        self.recency = recency;
        self
    }
}

/// Per-signal score breakdown of a hit
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SignalBreakdown {
    /// Vector similarity in [0, 1]
    pub vector: f64,
    /// Lexical overlap in [0, 1]
    pub lexical: f64,
    /// Graph connectivity in [0, 1]
    pub graph: f64,
    /// Recency boost in [0, 1]
    pub recency: f64,
    /// Helpfulness multiplier in [0.5, 1.5]
    pub helpfulness: f64,
}

/// A ranked retrieval result
#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    /// The engram
    pub engram: Engram,
    /// Composite score
    pub score: f64,
    /// Per-signal breakdown
    pub signals: SignalBreakdown,
}

/// Post-filters applied to candidates
#[derive(Debug, Clone, Default)]
pub struct RetrievalFilters {
    /// Restrict to one category
    pub category: Option<Category>,
    /// Valid-time constraint
    pub validity: ValidityQuery,
    /// Importance floor
    pub min_importance: Option<f64>,
    /// Include superseded chain members (default: exclude)
    pub include_superseded: bool,
}

/// Outcome of a retrieval pass
#[derive(Debug)]
pub struct RetrievalOutcome {
    /// Ranked hits, best first
    pub hits: Vec<Hit>,
    /// Candidates considered before post-filtering
    pub total_searched: usize,
}

// ============================================================================
// RETRIEVER
// ============================================================================

/// Hybrid retriever over store, index, graph, and feedback
pub struct Retriever {
    store: Arc<EngramStore>,
    index: Arc<RwLock<VectorIndex>>,
    feedback: Arc<UsageFeedback>,
    graph: Arc<dyn KnowledgeGraph>,
    embedder: Option<Arc<dyn Embedder>>,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl Retriever {
    /// Wire a retriever over the engine's shared components
    pub fn new(
        store: Arc<EngramStore>,
        index: Arc<RwLock<VectorIndex>>,
        feedback: Arc<UsageFeedback>,
        graph: Arc<dyn KnowledgeGraph>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        Self {
            store,
            index,
            feedback,
            graph,
            embedder,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    /// Retrieve a ranked candidate list for a query
    ///
    /// `threshold` drops hits scoring below it; `deadline` converts an
    /// expired budget into a typed `Timeout` at stage boundaries. Returned
    /// ids get their access stats bumped as a side effect.
    pub fn retrieve(
        &self,
        query: &str,
        k: usize,
        weights: SignalWeights,
        filters: &RetrievalFilters,
        threshold: f64,
        ef_search: Option<usize>,
        deadline: Option<Instant>,
    ) -> Result<RetrievalOutcome> {
        let now = Utc::now();
        if k == 0 {
            return Ok(RetrievalOutcome {
                hits: Vec::new(),
                total_searched: 0,
            });
        }

        let candidate_limit = k * CANDIDATE_MULTIPLIER;
        let query_tokens = token_set(query);
        let query_entities = tokenize(query);

        // 1. Vector candidates (degrades to lexical-only on failure)
        let query_vector = self.query_embedding(query);
        let vector_hits: HashMap<i64, f32> = match &query_vector {
            Some(vector) => self.vector_candidates(vector, candidate_limit, ef_search),
            None => HashMap::new(),
        };
        check_deadline(deadline)?;

        // 2. Lexical candidates
        let lexical_ids = self.store.fts_candidates(query, candidate_limit)?;
        check_deadline(deadline)?;

        // 3. Union, hydrate, score
        let mut candidate_ids: HashSet<i64> = vector_hits.keys().copied().collect();
        candidate_ids.extend(lexical_ids.iter().copied());
        let total_searched = candidate_ids.len();

        let ids: Vec<i64> = candidate_ids.into_iter().collect();
        let engrams = self.store.fetch_many(&ids)?;
        check_deadline(deadline)?;

        let mut hits: Vec<Hit> = Vec::new();
        for (id, engram) in engrams {
            if !self.passes_filters(&engram, filters, now) {
                continue;
            }

            let vector = self.vector_score(&engram, &vector_hits, query_vector.as_deref(), id);
            let lexical = overlap_score(&query_tokens, &engram.content);
            let graph = self.graph.connection_score(&query_entities, id);

            // No content-bearing signal at all: not a result, however recent
            if vector == 0.0 && lexical == 0.0 && graph == 0.0 {
                continue;
            }

            let recency = (-engram.age_days(now) / RECENCY_HORIZON_DAYS).exp();
            let helpfulness = self.feedback.factor(id);
            let raw = weights.vector * vector
                + weights.lexical * lexical
                + weights.graph * graph
                + weights.recency * recency;
            let score = helpfulness * raw;

            if score < threshold {
                continue;
            }

            hits.push(Hit {
                engram,
                score,
                signals: SignalBreakdown {
                    vector,
                    lexical,
                    graph,
                    recency,
                    helpfulness,
                },
            });
        }

        // 4. Rank: score desc, then newest first, then smallest id
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.engram.inserted_at.cmp(&a.engram.inserted_at))
                .then_with(|| a.engram.id.cmp(&b.engram.id))
        });
        hits.truncate(k);

        // 5. Access tracking side effect
        let returned: Vec<i64> = hits.iter().map(|h| h.engram.id).collect();
        self.store.update_access(&returned, now)?;

        Ok(RetrievalOutcome {
            hits,
            total_searched,
        })
    }

    /// Embed the query, consulting the LRU cache first
    ///
    /// Returns `None` when no embedder is wired or embedding fails; the
    /// caller degrades to lexical-only retrieval.
    fn query_embedding(&self, query: &str) -> Option<Vec<f32>> {
        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(vector) = cache.get(query) {
                return Some(vector.clone());
            }
        }
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(query) {
            Ok(vector) => {
                if let Ok(mut cache) = self.query_cache.lock() {
                    cache.put(query.to_string(), vector.clone());
                }
                Some(vector)
            }
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, falling back to lexical");
                None
            }
        }
    }

    /// Vector search with one retry; empty map on persistent failure
    fn vector_candidates(
        &self,
        vector: &[f32],
        limit: usize,
        ef_search: Option<usize>,
    ) -> HashMap<i64, f32> {
        for attempt in 0..2 {
            let guard = match self.index.read() {
                Ok(guard) => guard,
                Err(_) => break,
            };
            match guard.search(vector, limit, ef_search) {
                Ok(results) => return results.into_iter().collect(),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "vector index read failed");
                }
            }
        }
        HashMap::new()
    }

    /// Candidate similarity, re-ranked against the stored f32 vector
    fn vector_score(
        &self,
        engram: &Engram,
        vector_hits: &HashMap<i64, f32>,
        query_vector: Option<&[f32]>,
        id: i64,
    ) -> f64 {
        let approx = vector_hits.get(&id).copied();
        match (query_vector, &engram.embedding_f32) {
            // Exact re-rank when both vectors are at hand
            (Some(query), Some(stored)) if approx.is_some() => {
                f64::from(cosine_similarity(query, stored).max(0.0))
            }
            _ => f64::from(approx.unwrap_or(0.0).max(0.0)),
        }
    }

    fn passes_filters(
        &self,
        engram: &Engram,
        filters: &RetrievalFilters,
        now: DateTime<Utc>,
    ) -> bool {
        if !filters.include_superseded && !engram.is_active() {
            return false;
        }
        if let Some(category) = &filters.category {
            if engram.category != *category {
                return false;
            }
        }
        if let Some(min) = filters.min_importance {
            if engram.importance < min {
                return false;
            }
        }
        engram.is_valid_at(filters.validity.instant(now))
    }
}

fn check_deadline(deadline: Option<Instant>) -> Result<()> {
    if let Some(deadline) = deadline {
        let now = Instant::now();
        if now >= deadline {
            return Err(EngineError::Timeout(now - deadline));
        }
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
