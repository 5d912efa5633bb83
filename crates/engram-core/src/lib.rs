//! # Engram Core
//!
//! Cognitive memory engine: a persistent, vector-indexed, temporally-aware
//! store of text memories (*engrams*) with:
//!
//! - **Hybrid retrieval**: vector similarity (HNSW via USearch), lexical
//!   overlap (FTS5 candidates), graph connectivity, and recency, scaled by a
//!   learned helpfulness factor
//! - **Supersession chains**: at-most-once-active replacement chains with
//!   cycle rejection and full history traversal
//! - **Valid-time queries**: facts carry an optional validity window and can
//!   be queried "as of" any instant
//! - **Importance-weighted decay**: banded decay rates, on-demand salience
//!   scores, and forgetting-time prediction
//! - **Sleep-cycle consolidation**: background maintenance during quiet
//!   periods that extracts patterns, codifies procedures, predicts
//!   knowledge-graph edges, merges near-duplicates, and prunes decayed
//!   memories
//!
//! Embeddings and the knowledge graph are external contracts ([`Embedder`],
//! [`KnowledgeGraph`]); the engine never computes a vector itself.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use engram_core::{Engine, EngineConfig, HashEmbedder, SearchRequest, StoreRequest};
//!
//! # fn main() -> engram_core::Result<()> {
//! let config = EngineConfig::at("engram.db");
//! let embedder = Arc::new(HashEmbedder::new(config.embedding_dimensions));
//! let engine = Engine::open_with(config, Some(embedder), None)?;
//!
//! engine.store(StoreRequest::new("Alice owns a red bicycle").importance(0.7))?;
//! let results = engine.search(SearchRequest::new("Alice bike").limit(5))?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod consolidation;
pub mod decay;
pub mod embeddings;
pub mod engine;
pub mod engram;
pub mod error;
pub mod feedback;
pub mod graph;
pub mod ingest;
pub mod search;
pub mod storage;
pub mod temporal;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Data model
pub use engram::{Category, Engram, EngramDraft, SupersessionType};

// Errors
pub use error::{EngineError, Result};

// Configuration
pub use config::EngineConfig;

// Engine handle and operation surface
pub use engine::{
    ChainAuditFinding, DecayCheckResponse, Engine, IngestRequest, ListRequest, ListResponse,
    SearchRequest, SearchResponse, StatsResponse, StoreOutcome, StoreRequest, SupersedeResponse,
};

// Storage layer
pub use storage::{AtRiskEngram, EngramStore, ListPage, ListQuery, SortKey, StoreStats};

// Search
pub use search::{
    Hit, QueryIntent, QueryRouter, RetrievalFilters, RetrievalPlan, Retriever, SignalBreakdown,
    SignalWeights, VectorIndex, VectorIndexConfig, VectorIndexStats,
};

// Temporal chains
pub use temporal::{filter_by_validity, ChainManager, ValidityQuery};

// Consolidation
pub use consolidation::{
    ActivityStats, ActivityTracker, ConsolidationCandidate, SleepCycle, SleepCycleReport,
};

// Feedback
pub use feedback::UsageFeedback;

// Ingest
pub use ingest::{ChunkStrategy, IngestOutcome, IngestPipeline};

// External contracts
pub use embeddings::{cosine_similarity, Embedder, EmbedderError, HashEmbedder};
pub use graph::{InMemoryGraph, KnowledgeGraph, NullGraph};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        Category, Embedder, Engine, EngineConfig, EngineError, Engram, EngramDraft,
        IngestRequest, KnowledgeGraph, ListRequest, Result, SearchRequest, SortKey,
        StoreRequest, SupersessionType,
    };
}
