//! Usage feedback
//!
//! Callers report which retrieved memories were helpful and which were noise.
//! Events queue in memory per session, `flush` aggregates them into the
//! helpfulness table, and retrieval multiplies similarity by a per-engram
//! factor in [0.5, 1.5]. Factors are served from a copy-on-write snapshot so
//! readers never block writers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::error::{EngineError, Result};
use crate::storage::EngramStore;

/// Hard bounds of the helpfulness multiplier
const FACTOR_FLOOR: f64 = 0.5;
const FACTOR_CEIL: f64 = 1.5;

/// Direction of a feedback signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The memory helped
    Useful,
    /// The memory was noise
    Noise,
}

/// A pending feedback event
#[derive(Debug, Clone)]
pub struct FeedbackEvent {
    /// Session the signal came from
    pub session_id: String,
    /// Engram the signal applies to
    pub engram_id: i64,
    /// Direction
    pub signal: Signal,
    /// When the signal was recorded
    pub at: DateTime<Utc>,
}

/// Helpfulness learning over retrieval results
pub struct UsageFeedback {
    store: Arc<EngramStore>,
    pending: Mutex<Vec<FeedbackEvent>>,
    /// Copy-on-write factor snapshot; readers clone the Arc and move on
    factors: RwLock<Arc<HashMap<i64, f64>>>,
    smoothing_k: u32,
}

impl UsageFeedback {
    /// Create over the given store, loading any persisted aggregates
    pub fn new(store: Arc<EngramStore>, smoothing_k: u32) -> Result<Self> {
        let feedback = Self {
            store,
            pending: Mutex::new(Vec::new()),
            factors: RwLock::new(Arc::new(HashMap::new())),
            smoothing_k,
        };
        feedback.reload()?;
        Ok(feedback)
    }

    /// Record positive signals for a batch of engrams
    pub fn signal_useful(&self, session_id: &str, ids: &[i64]) {
        self.enqueue(session_id, ids, Signal::Useful);
    }

    /// Record negative signals for a batch of engrams
    pub fn signal_noise(&self, session_id: &str, ids: &[i64]) {
        self.enqueue(session_id, ids, Signal::Noise);
    }

    fn enqueue(&self, session_id: &str, ids: &[i64], signal: Signal) {
        let now = Utc::now();
        if let Ok(mut pending) = self.pending.lock() {
            pending.extend(ids.iter().map(|id| FeedbackEvent {
                session_id: session_id.to_string(),
                engram_id: *id,
                signal,
                at: now,
            }));
        }
    }

    /// Number of events waiting for a flush
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Aggregate pending events into the store and refresh the snapshot
    ///
    /// Returns the number of events processed.
    pub fn flush(&self) -> Result<usize> {
        let events: Vec<FeedbackEvent> = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| EngineError::Corruption("feedback queue poisoned".to_string()))?;
            std::mem::take(&mut *pending)
        };
        if events.is_empty() {
            return Ok(0);
        }

        let mut deltas: HashMap<i64, (i64, i64)> = HashMap::new();
        for event in &events {
            let entry = deltas.entry(event.engram_id).or_insert((0, 0));
            match event.signal {
                Signal::Useful => entry.0 += 1,
                Signal::Noise => entry.1 += 1,
            }
        }

        let rows: Vec<(i64, i64, i64)> = deltas
            .into_iter()
            .map(|(id, (pos, neg))| (id, pos, neg))
            .collect();
        self.store.upsert_helpfulness(&rows, Utc::now())?;
        self.reload()?;

        tracing::debug!(events = events.len(), engrams = rows.len(), "feedback flushed");
        Ok(events.len())
    }

    /// Helpfulness multiplier for an engram; unknown ids are neutral
    pub fn factor(&self, id: i64) -> f64 {
        self.snapshot().get(&id).copied().unwrap_or(1.0)
    }

    /// Apply the helpfulness factor to a similarity score
    pub fn adjust_similarity(&self, score: f64, id: i64) -> f64 {
        score * self.factor(id)
    }

    /// Current factor snapshot
    pub fn snapshot(&self) -> Arc<HashMap<i64, f64>> {
        self.factors
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_else(|_| Arc::new(HashMap::new()))
    }

    /// Rebuild the factor snapshot from persisted aggregates
    pub fn reload(&self) -> Result<()> {
        let rows = self.store.load_helpfulness()?;
        let k = self.smoothing_k as f64;
        let map: HashMap<i64, f64> = rows
            .into_iter()
            .map(|row| {
                let pos = row.positive as f64;
                let neg = row.negative as f64;
                let factor = (1.0 + (pos - neg) / (pos + neg + k)).clamp(FACTOR_FLOOR, FACTOR_CEIL);
                (row.engram_id, factor)
            })
            .collect();
        let mut guard = self
            .factors
            .write()
            .map_err(|_| EngineError::Corruption("factor snapshot poisoned".to_string()))?;
        *guard = Arc::new(map);
        Ok(())
    }

    /// Drop factors with no evidence in the last `ttl_days`
    ///
    /// Run by the sleep cycle; returns how many aggregates were removed.
    pub fn prune_stale(&self, ttl_days: i64, now: DateTime<Utc>) -> Result<usize> {
        let removed = self
            .store
            .prune_helpfulness_before(now - Duration::days(ttl_days))?;
        if removed > 0 {
            self.reload()?;
        }
        Ok(removed)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engram::EngramDraft;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<EngramStore>, UsageFeedback) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(EngramStore::open(&dir.path().join("engram.db")).unwrap());
        let feedback = UsageFeedback::new(store.clone(), 5).unwrap();
        (dir, store, feedback)
    }

    fn insert(store: &EngramStore, content: &str) -> i64 {
        store
            .insert(&EngramDraft::new(content), Utc::now())
            .unwrap()
            .id
    }

    #[test]
    fn test_unknown_ids_are_neutral() {
        let (_dir, _store, feedback) = setup();
        assert_eq!(feedback.factor(42), 1.0);
        assert_eq!(feedback.adjust_similarity(0.8, 42), 0.8);
    }

    #[test]
    fn test_positive_signals_raise_score() {
        let (_dir, store, feedback) = setup();
        let id = insert(&store, "helpful memory");

        feedback.signal_useful("session-1", &[id]);
        feedback.signal_useful("session-2", &[id]);
        assert_eq!(feedback.pending_count(), 2);
        assert_eq!(feedback.flush().unwrap(), 2);
        assert_eq!(feedback.pending_count(), 0);

        // h = 1 + (2 - 0) / (2 + 0 + 5)
        let factor = feedback.factor(id);
        assert!((factor - (1.0 + 2.0 / 7.0)).abs() < 1e-9);
        assert!(feedback.adjust_similarity(0.5, id) > 0.5);
    }

    #[test]
    fn test_negative_signals_lower_score() {
        let (_dir, store, feedback) = setup();
        let id = insert(&store, "noisy memory");

        feedback.signal_noise("s", &[id]);
        feedback.flush().unwrap();

        assert!(feedback.factor(id) < 1.0);
        assert!(feedback.adjust_similarity(0.5, id) < 0.5);
    }

    #[test]
    fn test_factor_clamped() {
        let (_dir, store, feedback) = setup();
        let id = insert(&store, "polarizing memory");

        // Even a large one-sided sample stays within the clamp
        let ids: Vec<i64> = std::iter::repeat_n(id, 200).collect();
        feedback.signal_useful("s", &ids);
        feedback.flush().unwrap();
        assert!(feedback.factor(id) <= FACTOR_CEIL);

        feedback.signal_noise("s", &std::iter::repeat_n(id, 1000).collect::<Vec<_>>());
        feedback.flush().unwrap();
        assert!(feedback.factor(id) >= FACTOR_FLOOR);
    }

    #[test]
    fn test_mixed_signals_smooth() {
        let (_dir, store, feedback) = setup();
        let id = insert(&store, "contested memory");
        feedback.signal_useful("a", &[id]);
        feedback.signal_noise("b", &[id]);
        feedback.flush().unwrap();
        // pos == neg -> neutral
        assert!((feedback.factor(id) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_flush_persists_across_reload() {
        let (_dir, store, feedback) = setup();
        let id = insert(&store, "durable factor");
        feedback.signal_useful("s", &[id]);
        feedback.flush().unwrap();

        let reloaded = UsageFeedback::new(store, 5).unwrap();
        assert!(reloaded.factor(id) > 1.0);
    }

    #[test]
    fn test_prune_stale_removes_old_factors() {
        let (_dir, store, feedback) = setup();
        let id = insert(&store, "fading factor");
        feedback.signal_useful("s", &[id]);
        feedback.flush().unwrap();
        assert!(feedback.factor(id) > 1.0);

        // A cutoff in the future makes everything stale
        let removed = feedback
            .prune_stale(7, Utc::now() + Duration::days(8))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(feedback.factor(id), 1.0);
    }

    #[test]
    fn test_empty_flush() {
        let (_dir, _store, feedback) = setup();
        assert_eq!(feedback.flush().unwrap(), 0);
    }
}
