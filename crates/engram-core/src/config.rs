//! Engine configuration
//!
//! One flat struct holding every recognized option; nothing is read from the
//! environment. Callers construct it, override what they need, and hand it to
//! the engine. Per-call knobs (limit, threshold, recency boost, history
//! inclusion, novelty skip) live on the request types instead.

use std::path::PathBuf;

/// Idle time before the sleep cycle may auto-trigger (5 minutes)
pub const DEFAULT_QUIET_PERIOD_MS: u64 = 5 * 60 * 1000;

/// Polling cadence for quiet-period detection (1 minute)
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 60 * 1000;

/// Observations needed before a pattern is extracted
pub const DEFAULT_MIN_MEMORIES_FOR_PATTERN: usize = 3;

/// Cosine similarity floor for predicting a knowledge-graph edge
pub const DEFAULT_EDGE_PREDICTION_SIMILARITY: f32 = 0.75;

/// Edges materialized per sleep cycle at most
pub const DEFAULT_EDGE_PREDICTION_CAP: usize = 25;

/// Days without access before an entity anchor counts as stale
pub const DEFAULT_STALE_ANCHOR_DAYS: i64 = 30;

/// Content length floor below which a stale anchor is prunable
pub const DEFAULT_MIN_ENTITY_ANCHOR_LENGTH: usize = 50;

/// HNSW neighbors per layer
pub const DEFAULT_HNSW_M: usize = 16;

/// HNSW expansion factor during construction
pub const DEFAULT_HNSW_EF_CONSTRUCTION: usize = 200;

/// HNSW expansion factor during search
pub const DEFAULT_HNSW_EF_SEARCH: usize = 64;

/// Smoothing constant for helpfulness factors
pub const DEFAULT_HELPFULNESS_SMOOTHING_K: u32 = 5;

/// Days a helpfulness factor survives without fresh evidence
pub const DEFAULT_HELPFULNESS_TTL_DAYS: i64 = 7;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the SQLite database file
    pub db_path: PathBuf,
    /// Path of the HNSW index file; defaults to `hnsw.idx` beside the database
    pub index_path: Option<PathBuf>,
    /// Embedding dimensionality the engine expects from its embedder
    pub embedding_dimensions: usize,

    // ---- Sleep cycle ----
    /// Idle time before the sleep cycle may auto-trigger
    pub quiet_period_ms: u64,
    /// Polling cadence for quiet detection
    pub check_interval_ms: u64,
    /// Observations needed before a pattern is extracted
    pub min_memories_for_pattern: usize,
    /// Cosine floor for edge prediction
    pub edge_prediction_similarity: f32,
    /// Edge materialization cap per cycle
    pub edge_prediction_cap_per_cycle: usize,
    /// Days without access before an entity anchor is stale
    pub stale_anchor_days: i64,
    /// Minimum content length for a stale anchor to survive
    pub min_entity_anchor_length: usize,
    /// Decay score below which unprotected engrams are pruned
    pub prune_decay_threshold: f64,
    /// Window of recent engrams consolidation stages look at
    pub recent_window_days: i64,
    /// Missing embeddings backfilled per cycle at most
    pub embed_backfill_cap_per_cycle: usize,

    // ---- Vector index ----
    /// HNSW neighbors per layer
    pub hnsw_m: usize,
    /// HNSW expansion factor for construction
    pub hnsw_ef_construction: usize,
    /// HNSW expansion factor for search
    pub hnsw_ef_search: usize,
    /// Tombstone ratio beyond which the index is rebuilt
    pub rebuild_tombstone_ratio: f64,

    // ---- Feedback ----
    /// Smoothing constant `k` for helpfulness factors
    pub helpfulness_smoothing_k: u32,
    /// Days a helpfulness factor survives without new evidence
    pub helpfulness_ttl_days: i64,

    // ---- Novelty & dedup ----
    /// Cosine similarity at which a new memory counts as a duplicate
    pub novelty_threshold: f32,
    /// Token-set Jaccard floor for near-duplicate consolidation
    pub dedup_jaccard_threshold: f64,
    /// Embedding cosine floor for near-duplicate consolidation
    pub dedup_cosine_threshold: f32,

    // ---- Ingest ----
    /// Per-file byte cap
    pub max_file_bytes: u64,
    /// Per-file chunk cap
    pub max_chunks_per_file: usize,
    /// Embedder retry attempts before giving up on a chunk
    pub embed_retry_cap: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("engram.db"),
            index_path: None,
            embedding_dimensions: crate::embeddings::DEFAULT_DIMENSIONS,
            quiet_period_ms: DEFAULT_QUIET_PERIOD_MS,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            min_memories_for_pattern: DEFAULT_MIN_MEMORIES_FOR_PATTERN,
            edge_prediction_similarity: DEFAULT_EDGE_PREDICTION_SIMILARITY,
            edge_prediction_cap_per_cycle: DEFAULT_EDGE_PREDICTION_CAP,
            stale_anchor_days: DEFAULT_STALE_ANCHOR_DAYS,
            min_entity_anchor_length: DEFAULT_MIN_ENTITY_ANCHOR_LENGTH,
            prune_decay_threshold: 0.05,
            recent_window_days: 7,
            embed_backfill_cap_per_cycle: 100,
            hnsw_m: DEFAULT_HNSW_M,
            hnsw_ef_construction: DEFAULT_HNSW_EF_CONSTRUCTION,
            hnsw_ef_search: DEFAULT_HNSW_EF_SEARCH,
            rebuild_tombstone_ratio: 0.10,
            helpfulness_smoothing_k: DEFAULT_HELPFULNESS_SMOOTHING_K,
            helpfulness_ttl_days: DEFAULT_HELPFULNESS_TTL_DAYS,
            novelty_threshold: 0.95,
            dedup_jaccard_threshold: 0.82,
            dedup_cosine_threshold: 0.90,
            max_file_bytes: 8 * 1024 * 1024,
            max_chunks_per_file: 512,
            embed_retry_cap: 3,
        }
    }
}

impl EngineConfig {
    /// Config rooted at a database path, everything else defaulted
    pub fn at(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }

    /// Resolved path of the HNSW index file
    pub fn resolved_index_path(&self) -> PathBuf {
        match &self.index_path {
            Some(p) => p.clone(),
            None => self.db_path.with_file_name("hnsw.idx"),
        }
    }

    /// Minimum gap between automatic sleep cycles (2x the quiet period)
    pub fn min_cycle_gap_ms(&self) -> u64 {
        self.quiet_period_ms * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.quiet_period_ms, 300_000);
        assert_eq!(config.check_interval_ms, 60_000);
        assert_eq!(config.hnsw_m, 16);
        assert_eq!(config.hnsw_ef_construction, 200);
        assert_eq!(config.hnsw_ef_search, 64);
        assert_eq!(config.helpfulness_smoothing_k, 5);
        assert_eq!(config.helpfulness_ttl_days, 7);
        assert_eq!(config.edge_prediction_cap_per_cycle, 25);
    }

    #[test]
    fn test_index_path_defaults_beside_db() {
        let config = EngineConfig::at("/tmp/mem/engram.db");
        assert_eq!(
            config.resolved_index_path(),
            PathBuf::from("/tmp/mem/hnsw.idx")
        );
    }

    #[test]
    fn test_min_cycle_gap_doubles_quiet_period() {
        let config = EngineConfig::default();
        assert_eq!(config.min_cycle_gap_ms(), 600_000);
    }
}
