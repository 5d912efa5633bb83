//! Cross-component invariants and round-trip laws

use std::sync::Arc;

use engram_core::{
    Category, Embedder, Engine, EngineConfig, EngineError, HashEmbedder, ListRequest,
    SearchRequest, SortKey, StoreRequest, SupersessionType, UsageFeedback,
};
use tempfile::TempDir;

fn engine() -> (TempDir, Engine) {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::at(dir.path().join("engram.db"));
    config.embedding_dimensions = 128;
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(128));
    let engine = Engine::open_with(config, Some(embedder), None).unwrap();
    (dir, engine)
}

fn store_distinct(engine: &Engine, content: &str) -> i64 {
    let mut request = StoreRequest::new(content);
    request.skip_novelty = true;
    engine.store(request).unwrap().id
}

// ============================================================================
// CHAIN INVARIANTS
// ============================================================================

#[test]
fn chains_have_exactly_one_active_member() {
    let (_dir, engine) = engine();
    let a = store_distinct(&engine, "release process v1");
    let b = store_distinct(&engine, "release process v2");
    let c = store_distinct(&engine, "release process v3");

    engine.supersede(a, b, SupersessionType::Update).unwrap();
    engine.supersede(b, c, SupersessionType::Refinement).unwrap();

    for id in [a, b, c] {
        let chain = engine.get_chain(id).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.iter().filter(|e| e.superseded_at.is_none()).count(), 1);
        // Sorted by insertion, no cycles
        for pair in chain.windows(2) {
            assert!(pair[0].inserted_at <= pair[1].inserted_at);
            assert_eq!(pair[1].supersedes_id, Some(pair[0].id));
        }
    }
}

#[test]
fn superseded_at_matches_successor_insertion() {
    let (_dir, engine) = engine();
    let a = store_distinct(&engine, "old value of the fact");
    let b = store_distinct(&engine, "new value of the fact");
    engine.supersede(a, b, SupersessionType::Update).unwrap();

    let old = engine.get(a).unwrap();
    let new = engine.get(b).unwrap();
    let gap = (old.superseded_at.unwrap() - new.inserted_at)
        .num_seconds()
        .abs();
    assert!(gap <= 1);
}

#[test]
fn get_current_follows_supersession() {
    let (_dir, engine) = engine();
    let a = store_distinct(&engine, "chain head alpha");
    let b = store_distinct(&engine, "chain head beta");
    engine.supersede(a, b, SupersessionType::Correction).unwrap();
    assert_eq!(engine.get_current(a).unwrap().id, b);
}

#[test]
fn supersede_is_not_idempotent() {
    let (_dir, engine) = engine();
    let a = store_distinct(&engine, "double supersede target");
    let b = store_distinct(&engine, "double supersede successor");

    engine.supersede(a, b, SupersessionType::Update).unwrap();
    assert!(matches!(
        engine.supersede(a, b, SupersessionType::Update),
        Err(EngineError::AlreadySuperseded(_))
    ));
}

// ============================================================================
// FEEDBACK MONOTONICITY
// ============================================================================

#[test]
fn feedback_adjustment_is_signed() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        engram_core::EngramStore::open(&dir.path().join("engram.db")).unwrap(),
    );
    let feedback = UsageFeedback::new(store.clone(), 5).unwrap();
    let base = 0.6;

    let positive = store
        .insert(&engram_core::EngramDraft::new("only praised"), chrono::Utc::now())
        .unwrap()
        .id;
    let negative = store
        .insert(&engram_core::EngramDraft::new("only flagged"), chrono::Utc::now())
        .unwrap()
        .id;
    let untouched = store
        .insert(&engram_core::EngramDraft::new("never mentioned"), chrono::Utc::now())
        .unwrap()
        .id;

    feedback.signal_useful("s", &[positive]);
    feedback.signal_noise("s", &[negative]);
    feedback.flush().unwrap();

    assert!(feedback.adjust_similarity(base, positive) >= base);
    assert!(feedback.adjust_similarity(base, negative) <= base);
    assert_eq!(feedback.adjust_similarity(base, untouched), base);
}

// ============================================================================
// PROTECTION
// ============================================================================

#[test]
fn protected_engrams_survive_consolidation() {
    let (_dir, engine) = engine();
    let mut request = StoreRequest::new("protected but worthless").importance(0.0);
    request.protected = true;
    request.skip_novelty = true;
    let shielded = engine.store(request).unwrap().id;

    // Several forced cycles; the protected engram must never disappear
    for _ in 0..3 {
        engine.run_sleep_cycle(true).unwrap();
        assert!(engine.get(shielded).is_ok());
    }

    // Direct deletion refuses too
    assert!(matches!(
        engine.delete(shielded),
        Err(EngineError::Protected(_))
    ));
}

// ============================================================================
// ROUND-TRIP LAWS
// ============================================================================

#[test]
fn insert_get_roundtrip_up_to_server_fields() {
    let (_dir, engine) = engine();
    let request = StoreRequest::new("round trip payload")
        .category(Category::Plan)
        .importance(0.8);
    let id = engine.store(request).unwrap().id;

    let engram = engine.get(id).unwrap();
    assert_eq!(engram.content, "round trip payload");
    assert_eq!(engram.category, Category::Plan);
    assert_eq!(engram.importance, 0.8);
    // Server-assigned fields are filled in
    assert!(engram.id > 0);
    assert!(engram.decay_rate > 0.0);
    assert_eq!(engram.access_count, 0);
}

#[test]
fn second_sleep_cycle_leaves_index_alone() {
    let (_dir, engine) = engine();
    for i in 0..4 {
        store_distinct(&engine, &format!("stable corpus entry {i}"));
    }
    engine.run_sleep_cycle(true).unwrap();
    let report = engine.run_sleep_cycle(true).unwrap().unwrap();
    // Nothing changed since the first cycle: rebuild is a no-op
    assert!(!report.index_rebuilt);
}

#[test]
fn repeated_ingest_yields_same_chunk_count() {
    let (_dir, engine) = engine();
    let content = "alpha section\n\nbeta section\n\ngamma section";

    let make_request = || {
        let mut request = engram_core::IngestRequest::from_content(content);
        request.category = Category::Observation;
        request
    };
    let first = engine.ingest(make_request()).unwrap();
    let second = engine.ingest(make_request()).unwrap();
    assert_eq!(first.chunks_created, 3);
    assert_eq!(first.chunks_created, second.chunks_created);
}

// ============================================================================
// BOUNDARIES
// ============================================================================

#[test]
fn importance_bounds_are_inclusive() {
    let (_dir, engine) = engine();
    assert!(engine
        .store(StoreRequest::new("floor importance").importance(0.0))
        .is_ok());
    assert!(engine
        .store(StoreRequest::new("ceiling importance").importance(1.0))
        .is_ok());
    assert!(matches!(
        engine.store(StoreRequest::new("below").importance(-0.01)),
        Err(EngineError::InvalidField { .. })
    ));
    assert!(matches!(
        engine.store(StoreRequest::new("above").importance(1.01)),
        Err(EngineError::InvalidField { .. })
    ));
}

#[test]
fn empty_content_rejected() {
    let (_dir, engine) = engine();
    assert!(matches!(
        engine.store(StoreRequest::new("")),
        Err(EngineError::InvalidField { .. })
    ));
}

#[test]
fn list_limit_zero_is_empty_without_more() {
    let (_dir, engine) = engine();
    store_distinct(&engine, "present memory");
    let page = engine
        .list(ListRequest {
            limit: 0,
            ..Default::default()
        })
        .unwrap();
    assert!(page.memories.is_empty());
    assert!(!page.has_more);
    assert!(page.next_cursor.is_none());
}

#[test]
fn cursor_pages_partition_all_sorts() {
    let (_dir, engine) = engine();
    for i in 0..9 {
        let mut request = StoreRequest::new(format!("partitioned entry {i}"))
            .importance([0.2, 0.5, 0.9][i % 3]);
        request.skip_novelty = true;
        engine.store(request).unwrap();
    }

    for sort in [SortKey::Recent, SortKey::Importance, SortKey::DecayScore] {
        let mut seen = std::collections::HashSet::new();
        let mut cursor = None;
        loop {
            let page = engine
                .list(ListRequest {
                    limit: 4,
                    cursor: cursor.clone(),
                    sort: Some(sort),
                    ..Default::default()
                })
                .unwrap();
            for engram in &page.memories {
                assert!(seen.insert(engram.id), "duplicate id in {sort:?} pages");
            }
            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }
        assert_eq!(seen.len(), 9, "missing ids in {sort:?} pages");
    }
}

#[test]
fn search_on_empty_store_is_empty() {
    let (_dir, engine) = engine();
    let response = engine
        .search(SearchRequest::new("anything at all"))
        .unwrap();
    assert!(response.results.is_empty());
    assert_eq!(response.coverage, 0.0);
}
