//! Activation spreading through the engine
//!
//! Seeds come from the vector index, spreading reads the persisted graph and
//! every returned record has its access recorded.

use strata_core::{ActivationConfig, Classification, Level, MemoryError, QueryResult};
use strata_e2e_tests::{TestDataFactory, TestDatabaseManager, axis, unit_at_angle};

fn params(threshold: f64, max_activations: usize, seed_k: usize) -> ActivationConfig {
    ActivationConfig {
        activation_threshold: threshold,
        max_activations,
        core_threshold: 0.85,
        seed_k,
        seed_level: Level::Concept,
    }
}

fn find<'a>(results: &'a [QueryResult], id: &str) -> Option<&'a QueryResult> {
    results.iter().find(|r| r.id == id)
}

#[test]
fn test_neighbor_above_threshold_is_peripheral() {
    let db = TestDatabaseManager::new_temp();
    TestDataFactory::create_two_node_scenario(&db.engine);

    let results = db
        .engine
        .query(&unit_at_angle(0.9), Some(&params(0.7, 50, 1)))
        .unwrap();
    assert_eq!(results.len(), 2);

    let a = find(&results, "A").unwrap();
    assert!((a.score - 0.9).abs() < 1e-4);
    assert_eq!(a.classification, Classification::Core);

    let b = find(&results, "B").unwrap();
    assert!((b.score - 0.72).abs() < 1e-4);
    assert_eq!(b.classification, Classification::Peripheral);
    assert_eq!(b.content, "concept B");

    // Ordered by activation
    assert_eq!(results[0].id, "A");
}

#[test]
fn test_neighbor_below_threshold_is_excluded() {
    let db = TestDatabaseManager::new_temp();
    TestDataFactory::create_two_node_scenario(&db.engine);

    let results = db
        .engine
        .query(&unit_at_angle(0.9), Some(&params(0.75, 50, 1)))
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "A");
}

#[test]
fn test_chain_attenuates_until_threshold() {
    let db = TestDatabaseManager::new_temp();
    let ids = TestDataFactory::create_chain(&db.engine, "c", 6, 0.9);

    // 1.0, 0.9, 0.81, 0.729, then 0.656 falls below 0.7
    let results = db.engine.query(&axis(0), Some(&params(0.7, 50, 1))).unwrap();
    let returned: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
    let expected: Vec<&str> = ids[..4].iter().map(String::as_str).collect();
    assert_eq!(returned, expected);
}

#[test]
fn test_dense_graph_respects_max_activations() {
    let db = TestDatabaseManager::new_temp();
    TestDataFactory::create_complete_graph(&db.engine, "g", 20, 0.9);

    let results = db.engine.query(&axis(0), Some(&params(0.5, 5, 1))).unwrap();
    assert_eq!(results.len(), 5);
    assert_eq!(results[0].id, "g000");
    assert!(results.iter().skip(1).all(|r| (r.score - 0.9).abs() < 1e-4));
}

#[test]
fn test_repeated_queries_are_deterministic() {
    let db = TestDatabaseManager::new_temp();
    TestDataFactory::create_complete_graph(&db.engine, "g", 12, 0.8);

    let p = params(0.5, 7, 1);
    let first: Vec<(String, f64)> = db
        .engine
        .query(&axis(0), Some(&p))
        .unwrap()
        .into_iter()
        .map(|r| (r.id, r.score))
        .collect();
    for _ in 0..3 {
        let again: Vec<(String, f64)> = db
            .engine
            .query(&axis(0), Some(&p))
            .unwrap()
            .into_iter()
            .map(|r| (r.id, r.score))
            .collect();
        assert_eq!(first, again);
    }
}

#[test]
fn test_query_records_access() {
    let db = TestDatabaseManager::new_temp();
    TestDataFactory::create_two_node_scenario(&db.engine);

    db.engine
        .query(&unit_at_angle(0.9), Some(&params(0.7, 50, 1)))
        .unwrap();
    db.engine
        .query(&unit_at_angle(0.9), Some(&params(0.7, 50, 1)))
        .unwrap();

    let a = db.engine.store().get("A").unwrap();
    let b = db.engine.store().get("B").unwrap();
    assert_eq!(a.access_count, 2);
    assert_eq!(b.access_count, 2);

    let edge = db.engine.graph().edge("A", "B").unwrap().unwrap();
    assert_eq!(edge.activation_count, 2);
    assert!(edge.last_activated_at.is_some());
    // Strength is not reinforced by reads
    assert!((edge.strength - 0.8).abs() < 1e-9);
}

#[test]
fn test_unrecorded_access_is_reported() {
    let db = TestDatabaseManager::new_temp();
    TestDataFactory::create_two_node_scenario(&db.engine);
    let p = params(0.7, 50, 1);

    let conn = db.raw_connection();
    conn.execute_batch(
        "CREATE TRIGGER block_touch BEFORE UPDATE ON memories
         BEGIN SELECT RAISE(ABORT, 'read only'); END;",
    )
    .unwrap();

    let outcome = db.engine.query_outcome(&unit_at_angle(0.9), Some(&p)).unwrap();
    assert!(!outcome.touched);
    assert_eq!(outcome.results.len(), 2);
    assert_eq!(db.engine.store().get("A").unwrap().access_count, 0);

    conn.execute_batch("DROP TRIGGER block_touch;").unwrap();
    let outcome = db.engine.query_outcome(&unit_at_angle(0.9), Some(&p)).unwrap();
    assert!(outcome.touched);
    assert_eq!(db.engine.store().get("A").unwrap().access_count, 1);
}

#[test]
fn test_seeds_only_from_seed_level() {
    let db = TestDatabaseManager::new_temp();
    db.engine
        .store()
        .put(&TestDataFactory::episode("e", axis(0)))
        .unwrap();

    let results = db.engine.query(&axis(0), Some(&params(0.5, 10, 5))).unwrap();
    assert!(results.is_empty());

    let mut episodic = params(0.5, 10, 5);
    episodic.seed_level = Level::Episode;
    let results = db.engine.query(&axis(0), Some(&episodic)).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].classification, Classification::Core);
}

#[test]
fn test_removed_record_never_returned() {
    let db = TestDatabaseManager::new_temp();
    TestDataFactory::create_two_node_scenario(&db.engine);
    db.engine.remove_record("B").unwrap();

    let results = db
        .engine
        .query(&unit_at_angle(0.9), Some(&params(0.1, 50, 5)))
        .unwrap();
    assert!(find(&results, "B").is_none());
}

#[test]
fn test_invalid_probe_rejected() {
    let db = TestDatabaseManager::new_temp();
    let result = db.engine.query(&[1.0, 0.0], None);
    assert!(matches!(result, Err(MemoryError::Validation(_))));
}
