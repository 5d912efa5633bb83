//! Temporal chain manager
//!
//! Supersession chains are singly-linked lists: each successor points at the
//! predecessor it replaces, and exactly one member per chain is current
//! (`superseded_at` null). This module owns chain mutation and traversal,
//! plus the valid-time filtering used by retrieval.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::engram::{Engram, SupersessionType};
use crate::error::{EngineError, Result};
use crate::storage::EngramStore;

/// Which instant a valid-time query is asked at
///
/// `T = valid_at ?? as_of ?? now`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidityQuery {
    /// Database-time viewpoint
    pub as_of: Option<DateTime<Utc>>,
    /// Valid-time instant the fact must hold at
    pub valid_at: Option<DateTime<Utc>>,
}

impl ValidityQuery {
    /// Resolve the effective query instant
    pub fn instant(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.valid_at.or(self.as_of).unwrap_or(now)
    }

    /// Whether any temporal constraint was supplied
    pub fn is_constrained(&self) -> bool {
        self.as_of.is_some() || self.valid_at.is_some()
    }
}

/// Keep only engrams whose valid-time window admits the query instant
///
/// An engram passes when `valid_from <= T` and `valid_until` is either null
/// or strictly after `T`.
pub fn filter_by_validity(
    engrams: Vec<Engram>,
    query: ValidityQuery,
    now: DateTime<Utc>,
) -> Vec<Engram> {
    let t = query.instant(now);
    engrams.into_iter().filter(|e| e.is_valid_at(t)).collect()
}

// ============================================================================
// CHAIN MANAGER
// ============================================================================

/// Supersession chain operations over the store
pub struct ChainManager {
    store: Arc<EngramStore>,
}

impl ChainManager {
    /// Create a manager over the given store
    pub fn new(store: Arc<EngramStore>) -> Self {
        Self { store }
    }

    /// Replace `old_id` with `new_id`
    ///
    /// Atomic and linearizable: once this returns, every reader sees the old
    /// engram's `superseded_at` and the new engram's `supersedes_id` set.
    /// Fails with `AlreadySuperseded` if `old_id` has a successor, with
    /// `Cycle` if the link would close the chain into a loop, and with
    /// `NoSuchEngram` when either id is missing. The store performs the
    /// cycle walk again inside the write transaction, so concurrent
    /// supersessions cannot race a loop past this check.
    pub fn supersede(&self, old_id: i64, new_id: i64, kind: SupersessionType) -> Result<()> {
        // Fast-path check outside the writer: walk successors from new_id
        let mut cursor = new_id;
        let mut seen = HashSet::new();
        while let Some(successor) = self.store.successor_of(cursor)? {
            if successor == old_id {
                return Err(EngineError::Cycle { old_id, new_id });
            }
            if !seen.insert(successor) {
                return Err(EngineError::Corruption(format!(
                    "existing supersession cycle through engram {successor}"
                )));
            }
            cursor = successor;
        }

        self.store.apply_supersession(old_id, new_id, kind)
    }

    /// Full chain from original to current, given any member
    pub fn get_chain(&self, id: i64) -> Result<Vec<Engram>> {
        let engram = self.store.get(id)?;
        let mut seen = HashSet::from([engram.id]);

        // Walk back to the original
        let mut chain = vec![engram];
        while let Some(predecessor_id) = chain.last().and_then(|e| e.supersedes_id) {
            if !seen.insert(predecessor_id) {
                return Err(EngineError::Corruption(format!(
                    "supersession cycle through engram {predecessor_id}"
                )));
            }
            chain.push(self.store.get(predecessor_id)?);
        }
        chain.reverse();

        // Walk forward to the current
        let mut cursor = chain.last().map(|e| e.id).unwrap_or(id);
        while let Some(successor_id) = self.store.successor_of(cursor)? {
            if !seen.insert(successor_id) {
                return Err(EngineError::Corruption(format!(
                    "supersession cycle through engram {successor_id}"
                )));
            }
            chain.push(self.store.get(successor_id)?);
            cursor = successor_id;
        }

        Ok(chain)
    }

    /// The current (active) member of the chain containing `id`
    pub fn get_current(&self, id: i64) -> Result<Engram> {
        let chain = self.get_chain(id)?;
        chain
            .into_iter()
            .next_back()
            .ok_or(EngineError::NoSuchEngram(id))
    }

    /// The original (first) member of the chain containing `id`
    pub fn get_original(&self, id: i64) -> Result<Engram> {
        let chain = self.get_chain(id)?;
        chain.into_iter().next().ok_or(EngineError::NoSuchEngram(id))
    }

    /// Number of engrams in the chain containing `id`
    pub fn chain_length(&self, id: i64) -> Result<usize> {
        Ok(self.get_chain(id)?.len())
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

    fn setup() -> (TempDir, Arc<EngramStore>, ChainManager) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(EngramStore::open(&dir.path().join("engram.db")).unwrap());
        let manager = ChainManager::new(store.clone());
        (dir, store, manager)
    }

    fn insert(store: &EngramStore, content: &str) -> i64 {
        store
            .insert(&EngramDraft::new(content), Utc::now())
            .unwrap()
            .id
    }

    #[test]
    fn test_supersede_and_traverse() {
        let (_dir, store, manager) = setup();
        let e1 = insert(&store, "Bob works at Acme");
        let e2 = insert(&store, "Bob works at Globex");

        manager
            .supersede(e1, e2, SupersessionType::Update)
            .unwrap();

        let chain = manager.get_chain(e1).unwrap();
        assert_eq!(chain.iter().map(|e| e.id).collect::<Vec<_>>(), vec![e1, e2]);
        // Same chain from either member
        let chain_from_successor = manager.get_chain(e2).unwrap();
        assert_eq!(
            chain_from_successor.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![e1, e2]
        );

        assert_eq!(manager.get_current(e1).unwrap().id, e2);
        assert_eq!(manager.get_original(e2).unwrap().id, e1);
        assert_eq!(manager.chain_length(e1).unwrap(), 2);
    }

    #[test]
    fn test_chain_sorted_by_insertion() {
        let (_dir, store, manager) = setup();
        let a = insert(&store, "v1");
        let b = insert(&store, "v2");
        let c = insert(&store, "v3");
        manager.supersede(a, b, SupersessionType::Update).unwrap();
        manager.supersede(b, c, SupersessionType::Refinement).unwrap();

        let chain = manager.get_chain(b).unwrap();
        assert_eq!(chain.len(), 3);
        for pair in chain.windows(2) {
            assert!(pair[0].inserted_at <= pair[1].inserted_at);
        }
        // Exactly one active member
        assert_eq!(chain.iter().filter(|e| e.is_active()).count(), 1);
        assert!(chain.last().unwrap().is_active());
    }

    #[test]
    fn test_supersede_twice_reports_state() {
        let (_dir, store, manager) = setup();
        let e1 = insert(&store, "old");
        let e2 = insert(&store, "new");
        let e3 = insert(&store, "newer");

        manager.supersede(e1, e2, SupersessionType::Update).unwrap();
        assert!(matches!(
            manager.supersede(e1, e2, SupersessionType::Update),
            Err(EngineError::AlreadySuperseded(_))
        ));
        assert!(matches!(
            manager.supersede(e1, e3, SupersessionType::Update),
            Err(EngineError::AlreadySuperseded(_))
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let (_dir, store, manager) = setup();
        let a = insert(&store, "a");
        let b = insert(&store, "b");
        manager.supersede(a, b, SupersessionType::Update).unwrap();

        assert!(matches!(
            manager.supersede(b, a, SupersessionType::Update),
            Err(EngineError::Cycle { .. })
        ));
        assert!(matches!(
            manager.supersede(a, a, SupersessionType::Update),
            Err(EngineError::Cycle { .. })
        ));
    }

    #[test]
    fn test_missing_ids() {
        let (_dir, store, manager) = setup();
        let e = insert(&store, "present");
        assert!(matches!(
            manager.supersede(e, 999, SupersessionType::Update),
            Err(EngineError::NoSuchEngram(999))
        ));
        assert!(matches!(
            manager.supersede(999, e, SupersessionType::Update),
            Err(EngineError::NoSuchEngram(999))
        ));
        assert!(matches!(
            manager.get_chain(999),
            Err(EngineError::NoSuchEngram(999))
        ));
    }

    #[test]
    fn test_singleton_chain() {
        let (_dir, store, manager) = setup();
        let e = insert(&store, "alone");
        let chain = manager.get_chain(e).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(manager.get_current(e).unwrap().id, e);
        assert_eq!(manager.get_original(e).unwrap().id, e);
    }

    #[test]
    fn test_validity_filter() {
        let (_dir, store, _manager) = setup();
        let now = Utc::now();
        let from = "2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let until = "2024-06-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();

        let windowed = store
            .insert(
                &EngramDraft::new("Q1 pricing").valid_between(Some(from), Some(until)),
                now,
            )
            .unwrap();
        let open = store.insert(&EngramDraft::new("evergreen"), now).unwrap();

        let inside = "2024-03-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let outside = "2024-07-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();

        let kept = filter_by_validity(
            vec![windowed.clone(), open.clone()],
            ValidityQuery {
                valid_at: Some(inside),
                as_of: None,
            },
            now,
        );
        assert_eq!(kept.len(), 2);

        let kept = filter_by_validity(
            vec![windowed.clone(), open.clone()],
            ValidityQuery {
                valid_at: Some(outside),
                as_of: None,
            },
            now,
        );
        assert_eq!(kept.iter().map(|e| e.id).collect::<Vec<_>>(), vec![open.id]);

        // valid_at takes precedence over as_of
        let query = ValidityQuery {
            valid_at: Some(inside),
            as_of: Some(outside),
        };
        assert_eq!(query.instant(now), inside);
    }

    #[test]
    fn test_validity_boundary_exclusive_upper() {
        let now = Utc::now();
        let from = "2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let until = "2024-06-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let (_dir, store, _manager) = setup();
        let e = store
            .insert(
                &EngramDraft::new("bounded").valid_between(Some(from), Some(until)),
                now,
            )
            .unwrap();

        // Inclusive lower bound, exclusive upper bound
        assert!(e.is_valid_at(from));
        assert!(!e.is_valid_at(until));
    }
}
