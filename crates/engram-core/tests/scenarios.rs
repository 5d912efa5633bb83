//! End-to-end scenarios over the full engine

use std::sync::Arc;

use chrono::{DateTime, Utc};
use engram_core::{
    Category, Embedder, Engine, EngineConfig, HashEmbedder, ListRequest, SearchRequest,
    StoreRequest, SupersessionType,
};
use tempfile::TempDir;

fn engine() -> (TempDir, Engine) {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::at(dir.path().join("engram.db"));
    config.embedding_dimensions = 256;
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(256));
    let engine = Engine::open_with(config, Some(embedder), None).unwrap();
    (dir, engine)
}

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

// ============================================================================
// SCENARIO A: basic store + search
// ============================================================================

#[test]
fn scenario_basic_store_and_search() {
    let (_dir, engine) = engine();
    let stored = engine
        .store(
            StoreRequest::new("Alice owns a red bicycle")
                .category(Category::Fact)
                .importance(0.7),
        )
        .unwrap();
    engine
        .store(StoreRequest::new("The staging cluster runs four nodes"))
        .unwrap();
    engine
        .store(StoreRequest::new("Quarterly planning happens in March"))
        .unwrap();

    let response = engine
        .search(SearchRequest::new("Alice bike").limit(5))
        .unwrap();

    assert!(!response.results.is_empty());
    assert_eq!(response.results[0].engram.id, stored.id);
    assert!(response.results[0].signals.vector >= 0.3);
    assert!(response.coverage > 0.0);
}

// ============================================================================
// SCENARIO B: supersession
// ============================================================================

#[test]
fn scenario_supersession() {
    let (_dir, engine) = engine();
    let e1 = engine
        .store(StoreRequest::new("Bob works at Acme"))
        .unwrap();
    let e2 = engine
        .store(StoreRequest::new("Bob works at Globex"))
        .unwrap();

    engine
        .supersede(e1.id, e2.id, SupersessionType::Update)
        .unwrap();

    assert_eq!(engine.get_current(e1.id).unwrap().id, e2.id);

    let response = engine
        .search(SearchRequest::new("Bob employer").limit(5))
        .unwrap();
    let ids: Vec<i64> = response.results.iter().map(|h| h.engram.id).collect();
    assert!(ids.contains(&e2.id));
    assert!(!ids.contains(&e1.id));

    let chain = engine.get_chain(e1.id).unwrap();
    assert_eq!(
        chain.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![e1.id, e2.id]
    );
}

// ============================================================================
// SCENARIO C: temporal validity
// ============================================================================

#[test]
fn scenario_temporal_validity() {
    let (_dir, engine) = engine();
    let windowed = engine
        .store(
            StoreRequest::new("Support rotation is owned by team atlas")
                .valid_between(Some(ts("2024-01-01T00:00:00Z")), Some(ts("2024-06-01T00:00:00Z"))),
        )
        .unwrap();
    // Identical content, different validity window: both coexist
    let follow_up = engine
        .store(
            StoreRequest::new("Support rotation is owned by team atlas")
                .valid_between(Some(ts("2024-06-01T00:00:00Z")), None),
        )
        .unwrap();
    assert!(!follow_up.duplicate);
    assert_ne!(windowed.id, follow_up.id);

    let inside = engine
        .search(
            SearchRequest::new("support rotation owner")
                .limit(5)
                .valid_at(ts("2024-03-01T00:00:00Z")),
        )
        .unwrap();
    let ids: Vec<i64> = inside.results.iter().map(|h| h.engram.id).collect();
    assert!(ids.contains(&windowed.id));
    assert!(!ids.contains(&follow_up.id));

    let after = engine
        .search(
            SearchRequest::new("support rotation owner")
                .limit(5)
                .valid_at(ts("2024-07-01T00:00:00Z")),
        )
        .unwrap();
    let ids: Vec<i64> = after.results.iter().map(|h| h.engram.id).collect();
    assert!(!ids.contains(&windowed.id));
    assert!(ids.contains(&follow_up.id));
}

// ============================================================================
// SCENARIO D: temporal redirect
// ============================================================================

#[test]
fn scenario_temporal_redirect() {
    let (_dir, engine) = engine();
    engine
        .store(StoreRequest::new("migrate the billing database").category(Category::Plan))
        .unwrap();
    engine
        .store(StoreRequest::new("ship the new onboarding flow").category(Category::Plan))
        .unwrap();
    engine
        .store(StoreRequest::new("an unrelated fact about lighthouses"))
        .unwrap();

    let response = engine
        .search(SearchRequest::new("latest plan").limit(5))
        .unwrap();

    assert!(response.temporal_query);
    assert_eq!(response.query_type, "temporal_redirect");
    assert_eq!(response.results.len(), 2);
    // Chronological listing: newest plan first, no non-plan results
    assert_eq!(
        response.results[0].engram.content,
        "ship the new onboarding flow"
    );
    assert!(response
        .results
        .iter()
        .all(|h| h.engram.category == Category::Plan));
}

// ============================================================================
// SCENARIO E: feedback loop
// ============================================================================

#[test]
fn scenario_feedback_loop() {
    let (_dir, engine) = engine();
    let mut ids = Vec::new();
    for suffix in ["one", "two", "three"] {
        let mut request =
            StoreRequest::new(format!("incident postmortem notes {suffix}")).importance(0.5);
        request.skip_novelty = true;
        ids.push(engine.store(request).unwrap().id);
    }

    engine.signal_useful("session-a", &[ids[0]]);
    engine.signal_noise("session-a", &[ids[1], ids[2]]);
    engine.flush_feedback().unwrap();

    let response = engine
        .search(SearchRequest::new("incident postmortem notes").limit(3))
        .unwrap();
    assert_eq!(response.results[0].engram.id, ids[0]);
    let rank_of = |id: i64| {
        response
            .results
            .iter()
            .position(|h| h.engram.id == id)
            .unwrap()
    };
    assert!(rank_of(ids[0]) < rank_of(ids[1]));
    assert!(rank_of(ids[0]) < rank_of(ids[2]));
}

// ============================================================================
// SCENARIO F: sleep cycle
// ============================================================================

#[test]
fn scenario_sleep_cycle() {
    let (_dir, engine) = engine();
    for i in 0..10 {
        let mut request = StoreRequest::new(format!(
            "timeout in connection pool during batch {}",
            i / 2
        ))
        .category(Category::Observation);
        request.skip_novelty = true;
        engine.store(request).unwrap();
    }

    let report = engine.run_sleep_cycle(true).unwrap().expect("forced cycle runs");
    assert!(report.stage_errors.is_empty());
    assert!(report.patterns_extracted >= 1);
    assert!(report.duplicates_merged >= 1);

    // An entity anchor covering the pattern exists, attributed to the cycle
    let anchors = engine
        .list(ListRequest {
            limit: 10,
            category: Some(Category::EntityAnchor),
            ..Default::default()
        })
        .unwrap();
    assert!(!anchors.memories.is_empty());
    let anchor = &anchors.memories[0];
    assert_eq!(
        anchor.metadata.as_ref().unwrap()["source"].as_str(),
        Some("sleep_cycle")
    );
    assert!(anchor.content.contains("timeout"));

    // Near-identical pairs collapsed into merge-typed supersession chains
    let merged = engine
        .list(ListRequest {
            limit: 50,
            include_history: true,
            category: Some(Category::Observation),
            ..Default::default()
        })
        .unwrap();
    let superseded: Vec<_> = merged
        .memories
        .iter()
        .filter(|e| e.superseded_at.is_some())
        .collect();
    assert!(!superseded.is_empty());
    for old in superseded {
        let current = engine.get_current(old.id).unwrap();
        assert_ne!(current.id, old.id);
        assert_eq!(current.supersession_type, Some(SupersessionType::Merge));
    }
}
