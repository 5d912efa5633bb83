//! Knowledge graph contract
//!
//! The graph retrieval signal and the sleep cycle's edge prediction both talk
//! to an external knowledge graph through this seam. The engine ships a no-op
//! implementation (signal is zero when no graph is wired) and a small
//! in-memory one for embedded deployments and tests.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

/// External knowledge graph contract
pub trait KnowledgeGraph: Send + Sync {
    /// Normalized count of edges from the query's entities to the engram
    ///
    /// Returns a score in [0, 1]; zero when the graph knows nothing.
    fn connection_score(&self, query_entities: &[String], engram_id: i64) -> f64;

    /// Associate an entity name with an engram (written by consolidation)
    fn link_entity(&self, entity: &str, engram_id: i64);

    /// Materialize a predicted relationship edge between two engrams
    fn add_edge(&self, from: i64, to: i64, strength: f64);

    /// Total materialized edges
    fn edge_count(&self) -> usize;
}

/// Graph that knows nothing and records nothing
#[derive(Debug, Default)]
pub struct NullGraph;

impl KnowledgeGraph for NullGraph {
    fn connection_score(&self, _query_entities: &[String], _engram_id: i64) -> f64 {
        0.0
    }

    fn link_entity(&self, _entity: &str, _engram_id: i64) {}

    fn add_edge(&self, _from: i64, _to: i64, _strength: f64) {}

    fn edge_count(&self) -> usize {
        0
    }
}

/// A materialized relationship edge
#[derive(Debug, Clone)]
pub struct GraphEdge {
    /// Source engram
    pub from: i64,
    /// Target engram
    pub to: i64,
    /// Edge strength (similarity at prediction time)
    pub strength: f64,
    /// When the edge was materialized
    pub created_at: DateTime<Utc>,
}

/// In-memory knowledge graph
///
/// Entity links map entity tokens to the engrams that mention them; edges
/// connect engram pairs found similar by the sleep cycle.
#[derive(Debug, Default)]
pub struct InMemoryGraph {
    entities: RwLock<HashMap<String, HashSet<i64>>>,
    edges: RwLock<HashMap<(i64, i64), GraphEdge>>,
}

impl InMemoryGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Engrams linked to an entity
    pub fn engrams_for_entity(&self, entity: &str) -> Vec<i64> {
        self.entities
            .read()
            .map(|map| {
                map.get(&entity.to_lowercase())
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// All edges touching an engram
    pub fn edges_of(&self, engram_id: i64) -> Vec<GraphEdge> {
        self.edges
            .read()
            .map(|map| {
                map.values()
                    .filter(|e| e.from == engram_id || e.to == engram_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every entity link and edge pointing at an engram
    pub fn forget(&self, engram_id: i64) {
        if let Ok(mut entities) = self.entities.write() {
            for set in entities.values_mut() {
                set.remove(&engram_id);
            }
        }
        if let Ok(mut edges) = self.edges.write() {
            edges.retain(|_, e| e.from != engram_id && e.to != engram_id);
        }
    }
}

impl KnowledgeGraph for InMemoryGraph {
    fn connection_score(&self, query_entities: &[String], engram_id: i64) -> f64 {
        if query_entities.is_empty() {
            return 0.0;
        }
        let Ok(entities) = self.entities.read() else {
            return 0.0;
        };
        let connected = query_entities
            .iter()
            .filter(|entity| {
                entities
                    .get(&entity.to_lowercase())
                    .map(|set| set.contains(&engram_id))
                    .unwrap_or(false)
            })
            .count();
        (connected as f64 / query_entities.len() as f64).clamp(0.0, 1.0)
    }

    fn link_entity(&self, entity: &str, engram_id: i64) {
        if let Ok(mut entities) = self.entities.write() {
            entities
                .entry(entity.to_lowercase())
                .or_default()
                .insert(engram_id);
        }
    }

    fn add_edge(&self, from: i64, to: i64, strength: f64) {
        let key = if from <= to { (from, to) } else { (to, from) };
        if let Ok(mut edges) = self.edges.write() {
            edges.entry(key).or_insert(GraphEdge {
                from: key.0,
                to: key.1,
                strength,
                created_at: Utc::now(),
            });
        }
    }

    fn edge_count(&self) -> usize {
        self.edges.read().map(|map| map.len()).unwrap_or(0)
    }
}

// ============================================================================
// TESTS
// ============================================================================
