//! HNSW vector index
//!
//! Approximate k-nearest-neighbor over engram embeddings, backed by USearch
//! with int8 quantization so candidate ranking stays cheap. The index is a
//! rebuildable cache over the store: tombstoned removals accumulate until a
//! ratio threshold, then a rebuild reconstructs from active embeddings and
//! swaps in atomically. Keys are engram ids.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

/// Vector index error types
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum VectorIndexError {
    /// Failed to create the index
    #[error("index creation failed: {0}")]
    Creation(String),
    /// Failed to add a vector
    #[error("failed to add vector: {0}")]
    Add(String),
    /// Failed to reserve capacity
    #[error("failed to reserve capacity: {0}")]
    Capacity(String),
    /// Failed to search
    #[error("search failed: {0}")]
    Search(String),
    /// Failed to persist/load index
    #[error("persistence failed: {0}")]
    Persistence(String),
    /// Dimension mismatch
    #[error("invalid dimensions: expected {expected}, got {got}")]
    Dimensions {
        /// Configured dimensionality
        expected: usize,
        /// Supplied vector length
        got: usize,
    },
}

/// Configuration for the vector index
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    /// Number of dimensions
    pub dimensions: usize,
    /// HNSW neighbors per layer (`M`)
    pub connectivity: usize,
    /// Expansion factor while building (`ef_construction`)
    pub expansion_add: usize,
    /// Expansion factor while searching (`ef_search`)
    pub expansion_search: usize,
    /// Tombstone ratio beyond which a rebuild is due
    pub rebuild_tombstone_ratio: f64,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            dimensions: crate::embeddings::DEFAULT_DIMENSIONS,
            connectivity: crate::config::DEFAULT_HNSW_M,
            expansion_add: crate::config::DEFAULT_HNSW_EF_CONSTRUCTION,
            expansion_search: crate::config::DEFAULT_HNSW_EF_SEARCH,
            rebuild_tombstone_ratio: 0.10,
        }
    }
}

/// Index statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct VectorIndexStats {
    /// Live vectors
    pub total_vectors: usize,
    /// Removals since the last rebuild
    pub tombstones: usize,
    /// Vector dimensions
    pub dimensions: usize,
    /// HNSW connectivity
    pub connectivity: usize,
    /// Estimated memory usage in bytes
    pub memory_bytes: usize,
}

/// Outcome of a conditional rebuild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// Index was already healthy
    Unchanged,
    /// Index was reconstructed from the store
    Rebuilt {
        /// Vectors in the rebuilt index
        count: usize,
    },
}

// ============================================================================
// VECTOR INDEX
// ============================================================================

/// HNSW index over engram embeddings
pub struct VectorIndex {
    index: Index,
    config: VectorIndexConfig,
    live: HashSet<i64>,
    tombstones: usize,
    /// Freshness watermark; compared against the store's latest insert
    watermark: Option<DateTime<Utc>>,
}

impl VectorIndex {
    /// Create an empty index
    pub fn new(config: VectorIndexConfig) -> Result<Self, VectorIndexError> {
        let index = Self::raw_index(&config)?;
        Ok(Self {
            index,
            config,
            live: HashSet::new(),
            tombstones: 0,
            watermark: None,
        })
    }

    fn raw_index(config: &VectorIndexConfig) -> Result<Index, VectorIndexError> {
        let options = IndexOptions {
            dimensions: config.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::I8,
            connectivity: config.connectivity,
            expansion_add: config.expansion_add,
            expansion_search: config.expansion_search,
            multi: false,
        };
        Index::new(&options).map_err(|e| VectorIndexError::Creation(e.to_string()))
    }

    /// Live vector count
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether the index holds no live vectors
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Configured dimensionality
    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    /// Whether an engram id is indexed
    pub fn contains(&self, id: i64) -> bool {
        self.live.contains(&id)
    }

    fn ensure_capacity(&self, extra: usize) -> Result<(), VectorIndexError> {
        // usearch requires reserve() before add() or it may fault
        let needed = self.index.size() + extra;
        if needed > self.index.capacity() {
            let new_capacity = std::cmp::max(self.index.capacity() * 2, needed.max(16));
            self.index
                .reserve(new_capacity)
                .map_err(|e| VectorIndexError::Capacity(e.to_string()))?;
        }
        Ok(())
    }

    /// Add or replace a vector for an engram id
    pub fn insert(&mut self, id: i64, vector: &[f32]) -> Result<(), VectorIndexError> {
        if vector.len() != self.config.dimensions {
            return Err(VectorIndexError::Dimensions {
                expected: self.config.dimensions,
                got: vector.len(),
            });
        }

        if self.live.contains(&id) {
            self.index
                .remove(id as u64)
                .map_err(|e| VectorIndexError::Add(e.to_string()))?;
        }

        self.ensure_capacity(1)?;
        self.index
            .add(id as u64, vector)
            .map_err(|e| VectorIndexError::Add(e.to_string()))?;
        self.live.insert(id);
        self.watermark = Some(Utc::now());
        Ok(())
    }

    /// Tombstone a vector; returns whether it was present
    pub fn remove(&mut self, id: i64) -> Result<bool, VectorIndexError> {
        if !self.live.remove(&id) {
            return Ok(false);
        }
        self.index
            .remove(id as u64)
            .map_err(|e| VectorIndexError::Add(e.to_string()))?;
        self.tombstones += 1;
        Ok(true)
    }

    /// k-nearest search, descending similarity
    ///
    /// `ef_search` raises recall by oversampling the candidate fetch; the
    /// result is still truncated to `k`.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: Option<usize>,
    ) -> Result<Vec<(i64, f32)>, VectorIndexError> {
        if query.len() != self.config.dimensions {
            return Err(VectorIndexError::Dimensions {
                expected: self.config.dimensions,
                got: query.len(),
            });
        }
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let fetch = k.max(ef_search.unwrap_or(self.config.expansion_search));
        let matches = self
            .index
            .search(query, fetch)
            .map_err(|e| VectorIndexError::Search(e.to_string()))?;

        let mut results = Vec::with_capacity(matches.keys.len().min(k));
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            let id = *key as i64;
            if !self.live.contains(&id) {
                continue;
            }
            // Cosine distance -> similarity
            results.push((id, 1.0 - distance));
            if results.len() == k {
                break;
            }
        }
        Ok(results)
    }

    /// Fraction of entries that are tombstones
    pub fn tombstone_ratio(&self) -> f64 {
        let denominator = self.live.len() + self.tombstones;
        if denominator == 0 {
            0.0
        } else {
            self.tombstones as f64 / denominator as f64
        }
    }

    /// Whether the index should be reconstructed from the store
    pub fn needs_rebuild(&self, store_newest: Option<DateTime<Utc>>) -> bool {
        if self.tombstone_ratio() > self.config.rebuild_tombstone_ratio {
            return true;
        }
        match (self.watermark, store_newest) {
            (None, Some(_)) => true,
            (Some(watermark), Some(newest)) => watermark < newest,
            _ => false,
        }
    }

    /// Rebuild from the store when the index is unhealthy
    ///
    /// Triggers on tombstone ratio or a stale watermark; `entries` is only
    /// invoked when a rebuild is actually due.
    pub fn rebuild_if_needed<E>(
        &mut self,
        store_newest: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        entries: impl FnOnce() -> std::result::Result<Vec<(i64, Vec<f32>)>, E>,
    ) -> std::result::Result<RebuildOutcome, E>
    where
        E: From<VectorIndexError>,
    {
        if !self.needs_rebuild(store_newest) {
            return Ok(RebuildOutcome::Unchanged);
        }
        let entries = entries()?;
        let count = self.rebuild_from(&entries, now)?;
        Ok(RebuildOutcome::Rebuilt { count })
    }

    /// Reconstruct from scratch over the given (id, vector) entries
    ///
    /// Builds a fresh graph, then swaps it in; rebuilding on identical input
    /// is idempotent. Entries with the wrong dimensionality are skipped.
    pub fn rebuild_from(
        &mut self,
        entries: &[(i64, Vec<f32>)],
        now: DateTime<Utc>,
    ) -> Result<usize, VectorIndexError> {
        let fresh = Self::raw_index(&self.config)?;
        fresh
            .reserve(entries.len().max(16))
            .map_err(|e| VectorIndexError::Capacity(e.to_string()))?;

        let mut live = HashSet::with_capacity(entries.len());
        for (id, vector) in entries {
            if vector.len() != self.config.dimensions {
                tracing::warn!(
                    engram_id = id,
                    got = vector.len(),
                    expected = self.config.dimensions,
                    "skipping embedding with wrong dimensionality during rebuild"
                );
                continue;
            }
            fresh
                .add(*id as u64, vector)
                .map_err(|e| VectorIndexError::Add(e.to_string()))?;
            live.insert(*id);
        }

        let count = live.len();
        self.index = fresh;
        self.live = live;
        self.tombstones = 0;
        self.watermark = Some(now);
        Ok(count)
    }

    /// Index statistics
    pub fn stats(&self) -> VectorIndexStats {
        VectorIndexStats {
            total_vectors: self.live.len(),
            tombstones: self.tombstones,
            dimensions: self.config.dimensions,
            connectivity: self.config.connectivity,
            memory_bytes: self.index.serialized_length(),
        }
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    /// Save the index and its sidecar metadata to disk
    pub fn save(&self, path: &Path) -> Result<(), VectorIndexError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| VectorIndexError::Persistence("invalid path".to_string()))?;
        self.index
            .save(path_str)
            .map_err(|e| VectorIndexError::Persistence(e.to_string()))?;

        let meta = serde_json::json!({
            "dimensions": self.config.dimensions,
            "live": self.live.iter().collect::<Vec<_>>(),
            "tombstones": self.tombstones,
            "watermark": self.watermark,
        });
        let meta_path = path.with_extension("idx.meta.json");
        let meta_str = serde_json::to_string(&meta)
            .map_err(|e| VectorIndexError::Persistence(e.to_string()))?;
        std::fs::write(&meta_path, meta_str)
            .map_err(|e| VectorIndexError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Load an index from disk
    ///
    /// A missing or unreadable file is an error; callers fall back to a
    /// fresh build from the store, which loses nothing.
    pub fn load(path: &Path, config: VectorIndexConfig) -> Result<Self, VectorIndexError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| VectorIndexError::Persistence("invalid path".to_string()))?;
        let index = Self::raw_index(&config)?;
        index
            .load(path_str)
            .map_err(|e| VectorIndexError::Persistence(e.to_string()))?;

        let meta_path = path.with_extension("idx.meta.json");
        let meta_str = std::fs::read_to_string(&meta_path)
            .map_err(|e| VectorIndexError::Persistence(e.to_string()))?;
        let meta: serde_json::Value = serde_json::from_str(&meta_str)
            .map_err(|e| VectorIndexError::Persistence(e.to_string()))?;

        let stored_dims = meta["dimensions"].as_u64().unwrap_or(0) as usize;
        if stored_dims != config.dimensions {
            return Err(VectorIndexError::Dimensions {
                expected: config.dimensions,
                got: stored_dims,
            });
        }
        let live: HashSet<i64> = serde_json::from_value(meta["live"].clone())
            .map_err(|e| VectorIndexError::Persistence(e.to_string()))?;
        let tombstones = meta["tombstones"].as_u64().unwrap_or(0) as usize;
        let watermark: Option<DateTime<Utc>> =
            serde_json::from_value(meta["watermark"].clone()).unwrap_or(None);

        Ok(Self {
            index,
            config,
            live,
            tombstones,
            watermark,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> VectorIndexConfig {
        VectorIndexConfig {
            dimensions: 8,
            ..Default::default()
        }
    }

    fn basis(dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; 8];
        v[dim] = 1.0;
        v
    }

    #[test]
    fn test_empty_index() {
        let index = VectorIndex::new(small_config()).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.len(), 0);
        let results = index.search(&basis(0), 5, None).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_insert_and_search() {
        let mut index = VectorIndex::new(small_config()).unwrap();
        index.insert(1, &basis(0)).unwrap();
        index.insert(2, &basis(1)).unwrap();
        index.insert(3, &basis(2)).unwrap();

        let results = index.search(&basis(0), 2, None).unwrap();
        assert_eq!(results[0].0, 1);
        assert!(results[0].1 > 0.99);
        assert!(results.len() <= 2);
    }

    #[test]
    fn test_insert_replaces() {
        let mut index = VectorIndex::new(small_config()).unwrap();
        index.insert(1, &basis(0)).unwrap();
        index.insert(1, &basis(1)).unwrap();
        assert_eq!(index.len(), 1);

        let results = index.search(&basis(1), 1, None).unwrap();
        assert_eq!(results[0].0, 1);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = VectorIndex::new(small_config()).unwrap();
        let err = index.insert(1, &[1.0, 2.0]);
        assert!(matches!(
            err,
            Err(VectorIndexError::Dimensions { expected: 8, got: 2 })
        ));
    }

    #[test]
    fn test_remove_tombstones() {
        let mut index = VectorIndex::new(small_config()).unwrap();
        index.insert(1, &basis(0)).unwrap();
        index.insert(2, &basis(1)).unwrap();

        assert!(index.remove(1).unwrap());
        assert!(!index.remove(1).unwrap());
        assert!(!index.contains(1));
        assert_eq!(index.stats().tombstones, 1);

        // Tombstoned entries never come back from search
        let results = index.search(&basis(0), 5, None).unwrap();
        assert!(results.iter().all(|(id, _)| *id != 1));
    }

    #[test]
    fn test_only_tombstones_returns_empty() {
        let mut index = VectorIndex::new(small_config()).unwrap();
        index.insert(1, &basis(0)).unwrap();
        index.remove(1).unwrap();
        let results = index.search(&basis(0), 5, None).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_tombstone_ratio_triggers_rebuild() {
        let mut index = VectorIndex::new(small_config()).unwrap();
        for i in 0..10 {
            index.insert(i, &basis((i % 8) as usize)).unwrap();
        }
        assert!(!index.needs_rebuild(None));

        index.remove(0).unwrap();
        index.remove(1).unwrap();
        // 2 tombstones over 10 entries > 10%
        assert!(index.tombstone_ratio() > 0.10);
        assert!(index.needs_rebuild(None));
    }

    #[test]
    fn test_stale_watermark_triggers_rebuild() {
        let index = VectorIndex::new(small_config()).unwrap();
        // Fresh index with no watermark lags a store that has inserts
        assert!(index.needs_rebuild(Some(Utc::now())));
        assert!(!index.needs_rebuild(None));
    }

    #[test]
    fn test_rebuild_resets_tombstones() {
        let mut index = VectorIndex::new(small_config()).unwrap();
        for i in 0..5 {
            index.insert(i, &basis(i as usize)).unwrap();
        }
        index.remove(0).unwrap();

        let entries: Vec<(i64, Vec<f32>)> =
            (1..5).map(|i| (i, basis(i as usize))).collect();
        let count = index.rebuild_from(&entries, Utc::now()).unwrap();
        assert_eq!(count, 4);
        assert_eq!(index.stats().tombstones, 0);
        assert!(!index.contains(0));
        assert!(index.contains(4));
    }

    #[test]
    fn test_rebuild_if_needed_outcomes() {
        let mut index = VectorIndex::new(small_config()).unwrap();
        for i in 0..10 {
            index.insert(i, &basis((i % 8) as usize)).unwrap();
        }

        // Healthy index: entries closure is never invoked
        let outcome = index
            .rebuild_if_needed(None, Utc::now(), || {
                Err::<Vec<(i64, Vec<f32>)>, VectorIndexError>(VectorIndexError::Creation(
                    "entries should not be fetched".to_string(),
                ))
            })
            .unwrap();
        assert_eq!(outcome, RebuildOutcome::Unchanged);

        // Push the tombstone ratio over the threshold
        index.remove(0).unwrap();
        index.remove(1).unwrap();
        let entries: Vec<(i64, Vec<f32>)> = (2..10).map(|i| (i, basis((i % 8) as usize))).collect();
        let outcome = index
            .rebuild_if_needed(None, Utc::now(), || {
                Ok::<_, VectorIndexError>(entries.clone())
            })
            .unwrap();
        assert_eq!(outcome, RebuildOutcome::Rebuilt { count: 8 });
        assert_eq!(index.stats().tombstones, 0);
    }

    #[test]
    fn test_rebuild_idempotent_on_same_entries() {
        let mut index = VectorIndex::new(small_config()).unwrap();
        let entries: Vec<(i64, Vec<f32>)> =
            (0..4).map(|i| (i, basis(i as usize))).collect();
        index.rebuild_from(&entries, Utc::now()).unwrap();
        let first: Vec<i64> = index
            .search(&basis(1), 4, None)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        index.rebuild_from(&entries, Utc::now()).unwrap();
        let second: Vec<i64> = index
            .search(&basis(1), 4, None)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hnsw.idx");

        let mut index = VectorIndex::new(small_config()).unwrap();
        index.insert(7, &basis(3)).unwrap();
        index.insert(9, &basis(5)).unwrap();
        index.save(&path).unwrap();

        let loaded = VectorIndex::load(&path, small_config()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(7));
        let results = loaded.search(&basis(3), 1, None).unwrap();
        assert_eq!(results[0].0, 7);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = VectorIndex::load(&dir.path().join("absent.idx"), small_config());
        assert!(matches!(result, Err(VectorIndexError::Persistence(_))));
    }
}
