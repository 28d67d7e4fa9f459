//! Dual-store consistency
//!
//! A record is visible only when both its vector entry and its relational row
//! exist, whatever fails in between.

use strata_core::{EdgeType, IngestItem, Level, MemoryError, VectorIndex};
use strata_e2e_tests::{TestDataFactory, TestDatabaseManager, axis};

#[test]
fn test_put_writes_both_halves() {
    let db = TestDatabaseManager::new_temp();
    let result = db
        .engine
        .store()
        .put(&TestDataFactory::concept("a", axis(0)))
        .unwrap();
    assert!(result.was_created());

    assert!(db.index.contains(Level::Concept, "a").unwrap());
    assert!(db.engine.store().relational().memory_exists("a").unwrap());
}

#[test]
fn test_identical_put_twice_stores_once() {
    let db = TestDatabaseManager::new_temp();
    let item = TestDataFactory::episode("dup", axis(1));

    assert!(db.engine.store().put(&item).unwrap().was_created());
    assert!(!db.engine.store().put(&item).unwrap().was_created());
    assert_eq!(db.record_count(), 1);

    assert_eq!(db.index.len(), 1);
}

#[test]
fn test_relational_failure_leaves_no_trace() {
    let db = TestDatabaseManager::new_temp();
    db.inject_insert_failure("boom");

    let result = db.engine.store().put(&TestDataFactory::concept("boom", axis(0)));
    assert!(matches!(result, Err(MemoryError::StoreUnavailable(_))));

    assert!(!db.index.contains(Level::Concept, "boom").unwrap());
    assert!(matches!(db.engine.store().get("boom"), Err(MemoryError::NotFound(_))));
    let hits = db.engine.store().query_nearest(Level::Concept, &axis(0), 5).unwrap();
    assert!(hits.iter().all(|(id, _)| id != "boom"));

    // Once the fault is gone the same id can be written
    db.clear_insert_failure("boom");
    assert!(db.engine.store().put(&TestDataFactory::concept("boom", axis(0))).unwrap().was_created());
}

#[test]
fn test_index_failure_skips_relational_phase() {
    let db = TestDatabaseManager::new_temp();
    db.index.set_fail_upsert(true);

    let result = db.engine.store().put(&TestDataFactory::concept("a", axis(0)));
    assert!(matches!(result, Err(MemoryError::StoreUnavailable(_))));
    assert!(db.is_empty());
}

#[test]
fn test_validation_errors_change_nothing() {
    let db = TestDatabaseManager::new_temp();

    // Wrong dimension
    let bad = IngestItem::new("bad", "x", vec![1.0, 0.0], Level::Concept);
    assert!(matches!(db.engine.store().put(&bad), Err(MemoryError::Validation(_))));

    // Self loop
    let looped = TestDataFactory::concept("self", axis(0)).with_link("self", 0.5, EdgeType::Causal);
    assert!(matches!(db.engine.store().put(&looped), Err(MemoryError::Validation(_))));

    // Unknown parent
    let orphan = TestDataFactory::episode("child", axis(0)).with_parent("nobody");
    assert!(matches!(db.engine.store().put(&orphan), Err(MemoryError::Validation(_))));

    // Empty id
    let empty = TestDataFactory::concept("", axis(0));
    assert!(matches!(db.engine.store().put(&empty), Err(MemoryError::Validation(_))));

    assert!(db.is_empty());
    assert!(db.index.is_empty());
}

#[test]
fn test_failed_index_delete_is_hidden_and_reconciled() {
    let mut db = TestDatabaseManager::new_temp();
    db.engine.store().put(&TestDataFactory::concept("a", axis(0))).unwrap();
    db.engine.store().put(&TestDataFactory::concept("b", axis(1))).unwrap();

    db.index.set_fail_delete(true);
    let result = db.engine.remove_record("a");
    assert!(matches!(result, Err(MemoryError::StoreUnavailable(_))));

    // The relational row is gone; the orphaned vector is never returned
    assert!(matches!(db.engine.store().get("a"), Err(MemoryError::NotFound(_))));
    let hits = db.engine.store().query_nearest(Level::Concept, &axis(0), 2).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, "b");

    db.index.set_fail_delete(false);
    db.reopen_with_index();
    assert_eq!(db.engine.reconciled().orphans_removed, 1);

    assert!(!db.index.contains(Level::Concept, "a").unwrap());
}

#[test]
fn test_reopen_restores_lost_index() {
    let mut db = TestDatabaseManager::new_temp();
    db.seed_records(6, Level::Episode);

    db.reopen();
    assert_eq!(db.engine.reconciled().restored, 6);

    assert_eq!(db.index.len(), 6);
    assert!(db.engine.store().get("seed-0003").is_ok());
}

#[test]
fn test_remove_cascades_edges() {
    let db = TestDatabaseManager::new_temp();
    db.engine.store().put(&TestDataFactory::concept("a", axis(0))).unwrap();
    db.engine
        .store()
        .put(&TestDataFactory::concept("b", axis(1)).with_link("a", 0.7, EdgeType::Semantic))
        .unwrap();
    db.engine
        .store()
        .put(&TestDataFactory::episode("c", axis(2)).with_parent("a"))
        .unwrap();

    db.engine.remove_record("a").unwrap();

    let graph = db.engine.graph();
    assert!(graph.edges("b").unwrap().is_empty());
    assert!(graph.edges("c").unwrap().is_empty());
    // The child survives without its parent
    assert_eq!(db.engine.store().get("c").unwrap().parent_id, None);
    assert_eq!(db.engine.stats().unwrap().total_connections, 0);
}

#[test]
fn test_health_reports_unreachable_index() {
    let db = TestDatabaseManager::new_temp();
    assert!(db.engine.health().healthy);

    db.index.set_fail_query(true);
    let health = db.engine.health();
    assert!(!health.healthy);
    assert!(health.relational_ok);
    assert!(!health.index_ok);
    assert!(!health.warnings.is_empty());
}
