//! Sleep cycle
//!
//! Periodic background maintenance pass over the whole store. Each cycle
//! executes an ordered list of stages; a stage failure is recorded in the
//! report and never aborts the rest of the cycle. Automatic cycles are gated
//! by the activity tracker, manual ones run immediately.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::embeddings::Embedder;
use crate::error::Result;
use crate::feedback::UsageFeedback;
use crate::graph::KnowledgeGraph;
use crate::search::VectorIndex;
use crate::storage::EngramStore;
use crate::temporal::ChainManager;

/// Counters emitted by one sleep cycle
#[derive(Debug, Clone, Serialize)]
pub struct SleepCycleReport {
    /// When the cycle started
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration
    pub duration_ms: u64,
    /// Whether the quiet-period gate was bypassed
    pub forced: bool,
    /// Entity-anchor patterns extracted from observations
    pub patterns_extracted: usize,
    /// Workflow summaries codified from action sequences
    pub procedures_created: usize,
    /// Engrams deleted by decay pruning
    pub memories_pruned: usize,
    /// Relationship edges materialized in the knowledge graph
    pub edges_predicted: usize,
    /// Near-duplicate pairs merged into supersession chains
    pub duplicates_merged: usize,
    /// Stale anchors removed and duplicate syntheses collapsed
    pub quality_issues_fixed: usize,
    /// Missing embeddings generated during index health
    pub embeddings_backfilled: usize,
    /// Whether the vector index was rebuilt
    pub index_rebuilt: bool,
    /// Stale helpfulness factors dropped
    pub helpfulness_pruned: usize,
    /// Per-stage errors, caught and recorded
    pub stage_errors: Vec<String>,
}

impl SleepCycleReport {
    fn new(forced: bool) -> Self {
        Self {
            started_at: Utc::now(),
            duration_ms: 0,
            forced,
            patterns_extracted: 0,
            procedures_created: 0,
            memories_pruned: 0,
            edges_predicted: 0,
            duplicates_merged: 0,
            quality_issues_fixed: 0,
            embeddings_backfilled: 0,
            index_rebuilt: false,
            helpfulness_pruned: 0,
            stage_errors: Vec::new(),
        }
    }
}

/// Background maintenance coordinator
pub struct SleepCycle {
    pub(super) store: Arc<EngramStore>,
    pub(super) index: Arc<RwLock<VectorIndex>>,
    pub(super) feedback: Arc<UsageFeedback>,
    pub(super) graph: Arc<dyn KnowledgeGraph>,
    pub(super) embedder: Option<Arc<dyn Embedder>>,
    pub(super) chains: ChainManager,
    pub(super) config: EngineConfig,
    pub(super) index_path: PathBuf,
}

impl SleepCycle {
    /// Wire a sleep cycle over the engine's shared components
    pub fn new(
        store: Arc<EngramStore>,
        index: Arc<RwLock<VectorIndex>>,
        feedback: Arc<UsageFeedback>,
        graph: Arc<dyn KnowledgeGraph>,
        embedder: Option<Arc<dyn Embedder>>,
        config: EngineConfig,
    ) -> Self {
        let index_path = config.resolved_index_path();
        Self {
            chains: ChainManager::new(store.clone()),
            store,
            index,
            feedback,
            graph,
            embedder,
            config,
            index_path,
        }
    }

    /// Run one full cycle
    ///
    /// Stage order: index health, quality maintenance, pattern extraction,
    /// procedure codification, edge prediction, pruning, feedback cleanup.
    pub fn run(&self, forced: bool) -> SleepCycleReport {
        let timer = Instant::now();
        let mut report = SleepCycleReport::new(forced);
        let now = report.started_at;

        let stages: [(&str, StageFn); 7] = [
            ("index_health", Self::stage_index_health),
            ("quality_maintenance", Self::stage_quality),
            ("pattern_extraction", Self::stage_patterns),
            ("procedure_codification", Self::stage_procedures),
            ("edge_prediction", Self::stage_edges),
            ("pruning", Self::stage_pruning),
            ("feedback_cleanup", Self::stage_feedback_cleanup),
        ];

        for (name, stage) in stages {
            let stage_timer = Instant::now();
            match stage(self, now, &mut report) {
                Ok(()) => {
                    tracing::info!(
                        stage = name,
                        elapsed_ms = stage_timer.elapsed().as_millis() as u64,
                        "sleep cycle stage complete"
                    );
                }
                Err(e) => {
                    tracing::warn!(stage = name, error = %e, "sleep cycle stage failed");
                    report.stage_errors.push(format!("{name}: {e}"));
                }
            }
        }

        report.duration_ms = timer.elapsed().as_millis() as u64;
        tracing::info!(
            duration_ms = report.duration_ms,
            patterns = report.patterns_extracted,
            procedures = report.procedures_created,
            pruned = report.memories_pruned,
            edges = report.edges_predicted,
            merged = report.duplicates_merged,
            quality = report.quality_issues_fixed,
            forced,
            "sleep cycle complete"
        );
        report
    }
}

type StageFn = fn(&SleepCycle, DateTime<Utc>, &mut SleepCycleReport) -> Result<()>;

// ============================================================================
// TESTS
// ============================================================================
