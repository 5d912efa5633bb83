//! Engine handle
//!
//! Owns every component, the configuration, and the background sleep-cycle
//! task. Callers hold an `Arc<Engine>` and go through the operation surface;
//! nothing about the engine is ambient or implicit. All user-initiated
//! operations feed the activity tracker that gates automatic maintenance.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::EngineConfig;
use crate::consolidation::{ActivityStats, ActivityTracker, SleepCycle, SleepCycleReport};
use crate::embeddings::{cosine_similarity, Embedder};
use crate::engram::{Category, Engram, EngramDraft, SupersessionType};
use crate::error::{EngineError, Result};
use crate::feedback::UsageFeedback;
use crate::graph::{KnowledgeGraph, NullGraph};
use crate::ingest::{ChunkStrategy, IngestLimits, IngestOutcome, IngestPipeline};
use crate::search::{
    Hit, QueryRouter, RetrievalFilters, Retriever, SignalBreakdown, SignalWeights, VectorIndex,
    VectorIndexConfig, VectorIndexStats,
};
use crate::storage::{EngramStore, ListQuery, SortKey};
use crate::temporal::{self, ChainManager, ValidityQuery};

/// Default result count for search
const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Decay-score threshold behind the `at_risk_count` statistic
const DEFAULT_AT_RISK_THRESHOLD: f64 = 0.2;

/// Candidates inspected per novelty check
const NOVELTY_PROBE_K: usize = 8;

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

/// Input for `memory.store`
#[derive(Debug, Clone)]
pub struct StoreRequest {
    /// Text content
    pub content: String,
    /// Category
    pub category: Category,
    /// Importance in [0, 1]
    pub importance: f64,
    /// Exempt from decay and pruning
    pub protected: bool,
    /// Start of the valid-time window
    pub valid_from: Option<DateTime<Utc>>,
    /// End of the valid-time window
    pub valid_until: Option<DateTime<Utc>>,
    /// Provenance of the validity window
    pub validity_source: Option<String>,
    /// Tags, carried in metadata
    pub tags: Vec<String>,
    /// Opaque metadata
    pub metadata: Option<serde_json::Value>,
    /// Bypass duplicate detection
    pub skip_novelty: bool,
}

impl StoreRequest {
    /// Request with defaults for everything but content
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            category: Category::Fact,
            importance: 0.5,
            protected: false,
            valid_from: None,
            valid_until: None,
            validity_source: None,
            tags: Vec::new(),
            metadata: None,
            skip_novelty: false,
        }
    }

    /// Set the category
    pub fn category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    /// Set the importance
    pub fn importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    /// Set the valid-time window
    pub fn valid_between(
        mut self,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_from = from;
        self.valid_until = until;
        self
    }
}

/// Output of `memory.store`
#[derive(Debug, Clone, Serialize)]
pub struct StoreOutcome {
    /// Id of the stored engram, or of the duplicate it collapsed into
    pub id: i64,
    /// Whether an existing near-duplicate absorbed this write
    pub duplicate: bool,
}

/// Input for `memory.search`
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Query text
    pub query: String,
    /// Result count
    pub limit: usize,
    /// Score floor
    pub threshold: f64,
    /// Category filter
    pub category: Option<Category>,
    /// Database-time viewpoint
    pub as_of: Option<DateTime<Utc>>,
    /// Valid-time instant the results must hold at
    pub valid_at: Option<DateTime<Utc>>,
    /// Importance floor
    pub min_importance: Option<f64>,
    /// Include superseded chain members
    pub include_history: bool,
    /// Override the recency weight
    pub recency_boost: Option<f64>,
    /// Let the router classify and possibly redirect the query
    pub use_router: bool,
    /// Raise HNSW recall for this call
    pub ef_search: Option<usize>,
    /// Deadline in milliseconds
    pub timeout_ms: Option<u64>,
}

impl SearchRequest {
    /// Request with defaults for everything but the query
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: DEFAULT_SEARCH_LIMIT,
            threshold: 0.0,
            category: None,
            as_of: None,
            valid_at: None,
            min_importance: None,
            include_history: false,
            recency_boost: None,
            use_router: true,
            ef_search: None,
            timeout_ms: None,
        }
    }

    /// Set the result count
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Set the valid-time instant
    pub fn valid_at(mut self, at: DateTime<Utc>) -> Self {
        self.valid_at = Some(at);
        self
    }

    /// Set the category filter
    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }
}

/// Output of `memory.search`
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    /// Ranked results
    pub results: Vec<Hit>,
    /// Candidates considered before post-filtering
    pub total_searched: usize,
    /// Routed intent, or `temporal_redirect` when the router rewrote the call
    pub query_type: String,
    /// Router confidence in the classification
    pub routing_confidence: f64,
    /// `returned / total_in_database * 100`
    pub coverage: f64,
    /// Whether the call was served by a chronological listing
    pub temporal_query: bool,
}

/// Input for `memory.list`
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    /// Page size
    pub limit: usize,
    /// Opaque cursor from a previous page
    pub cursor: Option<String>,
    /// Legacy offset
    pub offset: Option<usize>,
    /// Category filter
    pub category: Option<Category>,
    /// Sort order
    pub sort: Option<SortKey>,
    /// Include superseded chain members
    pub include_history: bool,
}

/// Output of `memory.list`
#[derive(Debug, Serialize)]
pub struct ListResponse {
    /// Engrams in sort order
    pub memories: Vec<Engram>,
    /// Total rows matching the filters
    pub total: i64,
    /// Cursor for the next page
    pub next_cursor: Option<String>,
    /// Whether more rows exist
    pub has_more: bool,
}

/// Output of `memory.stats`
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Total engrams including superseded
    pub total: i64,
    /// Count per category
    pub by_category: Vec<(String, i64)>,
    /// Mean importance
    pub avg_importance: f64,
    /// Engrams below the at-risk decay threshold
    pub at_risk_count: usize,
    /// Earliest insert
    pub oldest: Option<DateTime<Utc>>,
    /// Latest insert
    pub newest: Option<DateTime<Utc>>,
}

/// Output of `memory.decay_check`
#[derive(Debug, Serialize)]
pub struct DecayCheckResponse {
    /// Engrams below the threshold, most at-risk first
    pub at_risk: Vec<crate::storage::AtRiskEngram>,
}

/// Output of `memory.supersede`
#[derive(Debug, Clone, Serialize)]
pub struct SupersedeResponse {
    /// The replaced engram
    pub superseded_id: i64,
    /// Its successor
    pub successor_id: i64,
    /// Supersession label
    pub supersession_type: SupersessionType,
}

/// Input for `memory.ingest`
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// Inline content; exclusive with `path`
    pub content: Option<String>,
    /// File to ingest; exclusive with `content`
    pub path: Option<PathBuf>,
    /// Chunking strategy
    pub strategy: ChunkStrategy,
    /// Category for every chunk
    pub category: Category,
    /// Importance for every chunk
    pub importance: f64,
    /// Tags, carried in metadata
    pub tags: Vec<String>,
    /// Opaque metadata for every chunk
    pub metadata: Option<serde_json::Value>,
}

impl IngestRequest {
    /// Ingest inline content with defaults
    pub fn from_content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            path: None,
            strategy: ChunkStrategy::Auto,
            category: Category::Fact,
            importance: 0.5,
            tags: Vec::new(),
            metadata: None,
        }
    }
}

/// Advisory finding from the merge-supersession audit
#[derive(Debug, Clone, Serialize)]
pub struct ChainAuditFinding {
    /// Predecessor of the merge
    pub predecessor_id: i64,
    /// Successor that was expected to subsume it
    pub successor_id: i64,
    /// Predecessor tokens missing from the successor
    pub missing_tokens: Vec<String>,
}

// ============================================================================
// ENGINE
// ============================================================================

/// The cognitive memory engine
///
/// All methods take `&self`; the engine is `Send + Sync` and meant to live
/// in an `Arc` shared between the caller and its background task.
pub struct Engine {
    config: EngineConfig,
    store: Arc<EngramStore>,
    index: Arc<RwLock<VectorIndex>>,
    chains: ChainManager,
    retriever: Retriever,
    router: QueryRouter,
    feedback: Arc<UsageFeedback>,
    graph: Arc<dyn KnowledgeGraph>,
    embedder: Option<Arc<dyn Embedder>>,
    ingest_pipeline: IngestPipeline,
    sleep: SleepCycle,
    activity: ActivityTracker,
    paused: AtomicBool,
    shutdown: watch::Sender<bool>,
    background: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Open an engine with no embedder and no knowledge graph
    ///
    /// Retrieval degrades to lexical + recency signals; wire an embedder via
    /// [`Engine::open_with`] for semantic search.
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with(config, None, None)
    }

    /// Open an engine with optional embedder and knowledge graph
    pub fn open_with(
        config: EngineConfig,
        embedder: Option<Arc<dyn Embedder>>,
        graph: Option<Arc<dyn KnowledgeGraph>>,
    ) -> Result<Self> {
        if let Some(embedder) = &embedder {
            if embedder.dimensions() != config.embedding_dimensions {
                return Err(EngineError::InvalidField {
                    field: "embedding_dimensions",
                    reason: format!(
                        "embedder produces {} dimensions, config expects {}",
                        embedder.dimensions(),
                        config.embedding_dimensions
                    ),
                });
            }
        }
        let graph: Arc<dyn KnowledgeGraph> = graph.unwrap_or_else(|| Arc::new(NullGraph));

        let store = Arc::new(EngramStore::open(&config.db_path)?);

        let index_config = VectorIndexConfig {
            dimensions: config.embedding_dimensions,
            connectivity: config.hnsw_m,
            expansion_add: config.hnsw_ef_construction,
            expansion_search: config.hnsw_ef_search,
            rebuild_tombstone_ratio: config.rebuild_tombstone_ratio,
        };
        let index_path = config.resolved_index_path();
        let mut index = match VectorIndex::load(&index_path, index_config.clone()) {
            Ok(index) => index,
            Err(e) => {
                tracing::debug!(error = %e, "no persisted index, starting fresh");
                VectorIndex::new(index_config)?
            }
        };
        // The index is a cache over the store; catch it up before serving
        let outcome = index.rebuild_if_needed(store.max_inserted_at()?, Utc::now(), || {
            store.active_embeddings()
        })?;
        if let crate::search::RebuildOutcome::Rebuilt { count } = outcome {
            tracing::info!(count, "vector index rebuilt at startup");
        }
        let index = Arc::new(RwLock::new(index));

        let feedback = Arc::new(UsageFeedback::new(
            store.clone(),
            config.helpfulness_smoothing_k,
        )?);

        let retriever = Retriever::new(
            store.clone(),
            index.clone(),
            feedback.clone(),
            graph.clone(),
            embedder.clone(),
        );

        let ingest_pipeline = IngestPipeline::new(
            store.clone(),
            index.clone(),
            embedder.clone(),
            IngestLimits {
                max_bytes: config.max_file_bytes,
                max_chunks: config.max_chunks_per_file,
            },
            config.embed_retry_cap,
        );

        let sleep = SleepCycle::new(
            store.clone(),
            index.clone(),
            feedback.clone(),
            graph.clone(),
            embedder.clone(),
            config.clone(),
        );

        let activity = ActivityTracker::new(config.quiet_period_ms, config.min_cycle_gap_ms());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            chains: ChainManager::new(store.clone()),
            store,
            index,
            retriever,
            router: QueryRouter::new(),
            feedback,
            graph,
            embedder,
            ingest_pipeline,
            sleep,
            activity,
            paused: AtomicBool::new(false),
            shutdown,
            background: Mutex::new(None),
            config,
        })
    }

    /// Spawn the background maintenance loop
    ///
    /// Polls on `check_interval_ms`; when the quiet period has elapsed and
    /// the minimum cycle gap is respected, runs a sleep cycle off the async
    /// worker threads. Requires a tokio runtime; calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut guard = match self.background.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if guard.is_some() {
            return;
        }

        let engine = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                engine.config.check_interval_ms.max(1),
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if engine.paused.load(Ordering::Relaxed) {
                            continue;
                        }
                        if engine.activity.should_run_auto(Utc::now()) {
                            let worker = Arc::clone(&engine);
                            let report = tokio::task::spawn_blocking(move || {
                                worker.sleep.run(false)
                            })
                            .await;
                            match report {
                                Ok(_) => engine.activity.mark_cycle(Utc::now()),
                                Err(e) => {
                                    tracing::warn!(error = %e, "sleep cycle task panicked")
                                }
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *guard = Some(handle);
    }

    /// Signal the background loop to stop
    ///
    /// Cooperative: an in-flight cycle finishes its current stage list.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Ok(mut guard) = self.background.lock() {
            guard.take();
        }
    }

    /// Pause automatic maintenance (manual forced cycles still run)
    pub fn pause_maintenance(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    /// Resume automatic maintenance
    pub fn resume_maintenance(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Activity statistics of the quiet-period tracker
    pub fn activity_stats(&self) -> ActivityStats {
        self.activity.stats()
    }

    /// The knowledge graph this engine writes predicted edges into
    pub fn graph(&self) -> &Arc<dyn KnowledgeGraph> {
        &self.graph
    }

    /// Vector index statistics
    pub fn index_stats(&self) -> Result<VectorIndexStats> {
        Ok(self.index_read()?.stats())
    }

    // ========================================================================
    // OPERATION SURFACE
    // ========================================================================

    /// `memory.store`: persist one memory, with duplicate detection
    pub fn store(&self, request: StoreRequest) -> Result<StoreOutcome> {
        self.activity.record_activity();
        let started = Instant::now();

        let metadata = merge_tags(request.metadata.clone(), &request.tags);
        let draft = EngramDraft {
            content: request.content.clone(),
            category: request.category.clone(),
            importance: request.importance,
            protected: request.protected,
            valid_from: request.valid_from,
            valid_until: request.valid_until,
            validity_source: request.validity_source.clone(),
            metadata,
        };

        let vector = self
            .embedder
            .as_ref()
            .and_then(|embedder| match embedder.embed(&request.content) {
                Ok(vector) => Some(vector),
                Err(e) => {
                    tracing::warn!(error = %e, "store-time embedding failed");
                    None
                }
            });

        if !request.skip_novelty {
            if let Some(vector) = &vector {
                if let Some(existing) = self.find_duplicate(vector, &request)? {
                    self.store.update_access(&[existing], Utc::now())?;
                    tracing::info!(
                        engram_id = existing,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "store deduplicated onto existing engram"
                    );
                    return Ok(StoreOutcome {
                        id: existing,
                        duplicate: true,
                    });
                }
            }
        }

        let engram = self.store.insert(&draft, Utc::now())?;
        if let Some(vector) = &vector {
            self.store.set_embedding(engram.id, vector)?;
            if let Err(e) = self.index_write()?.insert(engram.id, vector) {
                tracing::warn!(engram_id = engram.id, error = %e, "index insert failed");
            }
        }

        tracing::info!(
            engram_id = engram.id,
            category = %engram.category,
            importance = engram.importance,
            embedded = vector.is_some(),
            latency_ms = started.elapsed().as_millis() as u64,
            "engram stored"
        );
        Ok(StoreOutcome {
            id: engram.id,
            duplicate: false,
        })
    }

    /// Duplicate probe: same category, same validity window, cosine above
    /// the novelty threshold
    fn find_duplicate(&self, vector: &[f32], request: &StoreRequest) -> Result<Option<i64>> {
        let candidates = match self.index_read()?.search(vector, NOVELTY_PROBE_K, None) {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(error = %e, "novelty probe failed");
                return Ok(None);
            }
        };
        for (id, approx) in candidates {
            if approx < self.config.novelty_threshold {
                break;
            }
            let Some(existing) = self.store.try_get(id)? else {
                continue;
            };
            if !existing.is_active()
                || existing.category != request.category
                || existing.valid_from != request.valid_from
                || existing.valid_until != request.valid_until
            {
                continue;
            }
            // Confirm against the exact stored vector
            let exact = existing
                .embedding_f32
                .as_ref()
                .map(|stored| cosine_similarity(vector, stored))
                .unwrap_or(approx);
            if exact >= self.config.novelty_threshold {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// `memory.search`: routed hybrid retrieval
    pub fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        self.activity.record_activity();
        let started = Instant::now();
        let deadline = request
            .timeout_ms
            .map(|ms| started + Duration::from_millis(ms));
        let total_in_db = self.store.count()?;

        let plan = self.router.classify(&request.query, request.limit.max(1));

        if request.use_router {
            if let Some(redirect) = &plan.redirect {
                let page = self.store.list(&ListQuery {
                    sort: redirect.sort,
                    limit: redirect.limit,
                    cursor: None,
                    offset: None,
                    category: request.category.clone().or(redirect.category.clone()),
                    include_superseded: request.include_history,
                })?;
                let now = Utc::now();
                let validity = ValidityQuery {
                    as_of: request.as_of,
                    valid_at: request.valid_at,
                };
                let engrams = temporal::filter_by_validity(page.engrams, validity, now);
                let results: Vec<Hit> = engrams
                    .into_iter()
                    .map(|engram| {
                        let recency = (-engram.age_days(now) / 30.0).exp();
                        Hit {
                            engram,
                            score: recency,
                            signals: SignalBreakdown {
                                recency,
                                helpfulness: 1.0,
                                ..Default::default()
                            },
                        }
                    })
                    .collect();
                let coverage = coverage_percent(results.len(), total_in_db);
                tracing::info!(
                    query_type = "temporal_redirect",
                    results = results.len(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "search served by chronological listing"
                );
                return Ok(SearchResponse {
                    results,
                    total_searched: page.total as usize,
                    query_type: "temporal_redirect".to_string(),
                    routing_confidence: plan.confidence,
                    coverage,
                    temporal_query: true,
                });
            }
        }

        let (weights, query_type, confidence) = if request.use_router {
            (plan.weights, plan.intent.as_str().to_string(), plan.confidence)
        } else {
            (SignalWeights::default(), "semantic".to_string(), 1.0)
        };
        let weights = match request.recency_boost {
            Some(boost) => weights.with_recency(boost),
            None => weights,
        };

        let filters = RetrievalFilters {
            category: request
                .category
                .clone()
                .or_else(|| request.use_router.then(|| plan.category.clone()).flatten()),
            validity: ValidityQuery {
                as_of: request.as_of,
                valid_at: request.valid_at,
            },
            min_importance: request.min_importance,
            include_superseded: request.include_history,
        };

        let outcome = self.retriever.retrieve(
            &request.query,
            request.limit,
            weights,
            &filters,
            request.threshold,
            request.ef_search.or(Some(self.config.hnsw_ef_search)),
            deadline,
        )?;

        let coverage = coverage_percent(outcome.hits.len(), total_in_db);
        tracing::info!(
            query_type = %query_type,
            results = outcome.hits.len(),
            total_searched = outcome.total_searched,
            latency_ms = started.elapsed().as_millis() as u64,
            "search complete"
        );
        Ok(SearchResponse {
            results: outcome.hits,
            total_searched: outcome.total_searched,
            query_type,
            routing_confidence: confidence,
            coverage,
            temporal_query: false,
        })
    }

    /// `memory.list`: paginated chronological or ranked listing
    pub fn list(&self, request: ListRequest) -> Result<ListResponse> {
        self.activity.record_activity();
        let page = self.store.list(&ListQuery {
            sort: request.sort.unwrap_or(SortKey::Recent),
            limit: request.limit,
            cursor: request.cursor.clone(),
            offset: request.offset,
            category: request.category.clone(),
            include_superseded: request.include_history,
        })?;
        Ok(ListResponse {
            memories: page.engrams,
            total: page.total,
            next_cursor: page.next_cursor,
            has_more: page.has_more,
        })
    }

    /// `memory.get`
    pub fn get(&self, id: i64) -> Result<Engram> {
        self.activity.record_activity();
        self.store.get(id)
    }

    /// `memory.delete`: refuses protected engrams
    pub fn delete(&self, id: i64) -> Result<()> {
        self.activity.record_activity();
        self.store.delete(id)?;
        let _ = self.index_write()?.remove(id);
        tracing::info!(engram_id = id, "engram deleted");
        Ok(())
    }

    /// `memory.stats`
    pub fn stats(&self) -> Result<StatsResponse> {
        self.activity.record_activity();
        let stats = self.store.stats()?;
        let at_risk = self
            .store
            .at_risk(DEFAULT_AT_RISK_THRESHOLD, usize::MAX, Utc::now())?;
        Ok(StatsResponse {
            total: stats.total,
            by_category: stats.by_category,
            avg_importance: stats.avg_importance,
            at_risk_count: at_risk.len(),
            oldest: stats.oldest,
            newest: stats.newest,
        })
    }

    /// `memory.decay_check`: engrams below a decay threshold
    pub fn decay_check(&self, threshold: f64, limit: usize) -> Result<DecayCheckResponse> {
        self.activity.record_activity();
        let at_risk = self.store.at_risk(threshold, limit, Utc::now())?;
        Ok(DecayCheckResponse { at_risk })
    }

    /// `memory.get_chain`
    pub fn get_chain(&self, id: i64) -> Result<Vec<Engram>> {
        self.activity.record_activity();
        self.chains.get_chain(id)
    }

    /// `memory.get_current`
    pub fn get_current(&self, id: i64) -> Result<Engram> {
        self.activity.record_activity();
        self.chains.get_current(id)
    }

    /// `memory.get_original`
    pub fn get_original(&self, id: i64) -> Result<Engram> {
        self.activity.record_activity();
        self.chains.get_original(id)
    }

    /// `memory.supersede`: replace one engram with another
    pub fn supersede(
        &self,
        old_id: i64,
        new_id: i64,
        kind: SupersessionType,
    ) -> Result<SupersedeResponse> {
        self.activity.record_activity();
        self.chains.supersede(old_id, new_id, kind)?;
        let _ = self.index_write()?.remove(old_id);
        tracing::info!(
            superseded_id = old_id,
            successor_id = new_id,
            kind = %kind,
            "engram superseded"
        );
        Ok(SupersedeResponse {
            superseded_id: old_id,
            successor_id: new_id,
            supersession_type: kind,
        })
    }

    /// `memory.ingest`: chunk a file or inline content into engrams
    pub fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome> {
        self.activity.record_activity();
        let content = match (&request.content, &request.path) {
            (Some(content), None) => content.clone(),
            (None, Some(path)) => {
                let size = std::fs::metadata(path)
                    .map(|m| m.len())
                    .map_err(|e| EngineError::InvalidField {
                        field: "path",
                        reason: format!("{}: {e}", path.display()),
                    })?;
                if size > self.config.max_file_bytes {
                    return Err(EngineError::FileTooLarge {
                        size,
                        cap: self.config.max_file_bytes,
                    });
                }
                std::fs::read_to_string(path).map_err(|e| EngineError::InvalidField {
                    field: "path",
                    reason: format!("{}: {e}", path.display()),
                })?
            }
            (Some(_), Some(_)) => {
                return Err(EngineError::InvalidField {
                    field: "content",
                    reason: "provide either content or path, not both".to_string(),
                });
            }
            (None, None) => return Err(EngineError::MissingArgument("content or path")),
        };

        let metadata = merge_tags(request.metadata.clone(), &request.tags);
        self.ingest_pipeline.ingest(
            &content,
            request.strategy,
            request.category.clone(),
            request.importance,
            metadata.as_ref(),
        )
    }

    /// `feedback.signal_useful`
    pub fn signal_useful(&self, session_id: &str, ids: &[i64]) {
        self.activity.record_activity();
        self.feedback.signal_useful(session_id, ids);
    }

    /// `feedback.signal_noise`
    pub fn signal_noise(&self, session_id: &str, ids: &[i64]) {
        self.activity.record_activity();
        self.feedback.signal_noise(session_id, ids);
    }

    /// `feedback.flush`: apply pending signals synchronously
    pub fn flush_feedback(&self) -> Result<usize> {
        self.feedback.flush()
    }

    /// Run a sleep cycle now
    ///
    /// `force` bypasses the quiet-period and minimum-gap gates; without it,
    /// the cycle only runs when an automatic trigger would fire. Returns
    /// `None` when gating skipped the cycle.
    pub fn run_sleep_cycle(&self, force: bool) -> Result<Option<SleepCycleReport>> {
        if !force {
            if self.paused.load(Ordering::Relaxed) {
                return Ok(None);
            }
            if !self.activity.should_run_auto(Utc::now()) {
                return Ok(None);
            }
        }
        let report = self.sleep.run(force);
        self.activity.mark_cycle(Utc::now());
        Ok(Some(report))
    }

    /// Audit `merge` supersessions for the non-shrinking content property
    ///
    /// Advisory only; a finding lists predecessor tokens the successor lost.
    pub fn audit_chains(&self) -> Result<Vec<ChainAuditFinding>> {
        let mut findings = Vec::new();
        for (predecessor_id, successor_id) in self.store.merge_pairs()? {
            let (Some(predecessor), Some(successor)) = (
                self.store.try_get(predecessor_id)?,
                self.store.try_get(successor_id)?,
            ) else {
                continue;
            };
            let successor_tokens = crate::search::token_set(&successor.content);
            let mut missing: Vec<String> = crate::search::token_set(&predecessor.content)
                .into_iter()
                .filter(|t| !successor_tokens.contains(t))
                .collect();
            if !missing.is_empty() {
                missing.sort();
                findings.push(ChainAuditFinding {
                    predecessor_id,
                    successor_id,
                    missing_tokens: missing,
                });
            }
        }
        Ok(findings)
    }

    fn index_read(&self) -> Result<std::sync::RwLockReadGuard<'_, VectorIndex>> {
        self.index
            .read()
            .map_err(|_| EngineError::Corruption("vector index lock poisoned".to_string()))
    }

    fn index_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, VectorIndex>> {
        self.index
            .write()
            .map_err(|_| EngineError::Corruption("vector index lock poisoned".to_string()))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Fold tags into the opaque metadata under a `tags` key
fn merge_tags(
    metadata: Option<serde_json::Value>,
    tags: &[String],
) -> Option<serde_json::Value> {
    if tags.is_empty() {
        return metadata;
    }
    let mut value = metadata.unwrap_or_else(|| serde_json::json!({}));
    if let Some(object) = value.as_object_mut() {
        object.insert("tags".to_string(), serde_json::json!(tags));
        Some(value)
    } else {
        Some(serde_json::json!({ "tags": tags, "wrapped": value }))
    }
}

fn coverage_percent(returned: usize, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    let raw = returned as f64 / total as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

// ============================================================================
// TESTS
// ============================================================================
