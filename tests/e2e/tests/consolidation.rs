//! Consolidation against a live engine
//!
//! Decay, promotion and retirement, plus the interaction between a running
//! pass and concurrent readers.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use strata_core::{EdgeType, Level, MemoryError, MemoryType};
use strata_e2e_tests::{TestDataFactory, TestDatabaseManager, axis};

#[test]
fn test_importance_decays_monotonically() {
    let db = TestDatabaseManager::new_temp();
    db.seed_records(3, Level::Episode);
    let scheduler = db.engine.scheduler();
    let start = Utc::now();

    let mut previous = db.engine.store().get("seed-0000").unwrap().importance_score;
    for days in [1, 2, 5, 10] {
        scheduler.run_once(start + ChronoDuration::days(days)).unwrap();
        let current = db.engine.store().get("seed-0000").unwrap().importance_score;
        assert!(current < previous, "day {}: {} !< {}", days, current, previous);
        assert!(current > 0.0);
        previous = current;
    }

    // Ten days at the episodic rate of 0.1 per day
    let expected = 0.5 * (-1.0f64).exp();
    assert!((previous - expected).abs() < 1e-3);
}

#[test]
fn test_repeat_run_at_same_instant_is_noop() {
    let db = TestDatabaseManager::new_temp();
    db.seed_records(2, Level::Episode);
    let now = Utc::now() + ChronoDuration::days(1);

    let first = db.engine.scheduler().run_once(now).unwrap();
    assert_eq!(first.decayed, 2);
    let second = db.engine.scheduler().run_once(now).unwrap();
    assert_eq!(second.scanned, 2);
    assert_eq!(second.decayed, 0);
}

#[test]
fn test_semantic_and_accessed_records_are_never_retired() {
    let db = TestDatabaseManager::new_temp();
    let store = db.engine.store();
    for id in ["stale", "semantic", "accessed"] {
        store.put(&TestDataFactory::episode(id, axis(0))).unwrap();
    }

    let mut semantic = store.get("semantic").unwrap();
    semantic.memory_type = MemoryType::Semantic;
    semantic.decay_rate = 0.01;
    assert!(store.update_if_version(&semantic, semantic.version).unwrap());
    store.touch(&["accessed".to_string()], &[]).unwrap();

    let report = db
        .engine
        .scheduler()
        .run_once(Utc::now() + ChronoDuration::days(400))
        .unwrap();
    assert_eq!(report.retired, 1);
    assert!(matches!(store.get("stale"), Err(MemoryError::NotFound(_))));

    // Far below the floor, still present
    let semantic = store.get("semantic").unwrap();
    assert!(semantic.importance_score < 0.1);
    assert_eq!(semantic.memory_type, MemoryType::Semantic);
    assert!(store.get("accessed").is_ok());
}

#[test]
fn test_retirement_can_be_disabled() {
    let mut config = TestDatabaseManager::test_config();
    config.consolidation.enable_retirement = false;
    let db = TestDatabaseManager::with_config(config);
    db.seed_records(2, Level::Episode);

    let report = db
        .engine
        .scheduler()
        .run_once(Utc::now() + ChronoDuration::days(400))
        .unwrap();
    assert_eq!(report.retired, 0);
    assert_eq!(db.record_count(), 2);
}

#[test]
fn test_promotion_switches_decay_rate() {
    let mut config = TestDatabaseManager::test_config();
    config.consolidation.consolidation_threshold = 2;
    let db = TestDatabaseManager::with_config(config);
    db.engine
        .store()
        .put(&TestDataFactory::concept("hot", axis(0)))
        .unwrap();

    // Two queries seed "hot" and record two accesses
    db.engine.query(&axis(0), None).unwrap();
    db.engine.query(&axis(0), None).unwrap();

    let report = db.engine.scheduler().run_once(Utc::now()).unwrap();
    assert_eq!(report.promoted, 1);
    let record = db.engine.store().get("hot").unwrap();
    assert_eq!(record.memory_type, MemoryType::Semantic);
    assert_eq!(record.access_count, 2);
    assert!((record.decay_rate - 0.01).abs() < 1e-12);
}

#[test]
fn test_dry_run_changes_nothing() {
    let db = TestDatabaseManager::new_temp();
    db.seed_records(4, Level::Episode);
    let before: Vec<_> = (0..4)
        .map(|i| db.engine.store().get(&format!("seed-{:04}", i)).unwrap())
        .collect();

    let report = db
        .engine
        .scheduler()
        .plan(Utc::now() + ChronoDuration::days(400))
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.retired, 4);

    for record in &before {
        assert_eq!(&db.engine.store().get(&record.id).unwrap(), record);
    }
    assert!(
        db.engine
            .store()
            .relational()
            .last_consolidation_at()
            .unwrap()
            .is_none()
    );
}

#[test]
fn test_connection_decay_since_last_activation() {
    let mut config = TestDatabaseManager::test_config();
    config.consolidation.connection_decay_rate = 0.1;
    config.consolidation.min_connection_strength = 0.2;
    config.consolidation.enable_retirement = false;
    let db = TestDatabaseManager::with_config(config);
    db.engine
        .store()
        .put(&TestDataFactory::concept("a", axis(0)))
        .unwrap();
    db.engine
        .store()
        .put(&TestDataFactory::concept("b", axis(1)))
        .unwrap();
    db.engine
        .graph()
        .upsert_edge("a", "b", 0.9, EdgeType::Associative)
        .unwrap();

    let report = db
        .engine
        .scheduler()
        .run_once(Utc::now() + ChronoDuration::days(5))
        .unwrap();
    assert_eq!(report.connections_decayed, 1);
    let strength = db.engine.graph().edge("a", "b").unwrap().unwrap().strength;
    assert!(strength < 0.9);
    assert!(strength > 0.5);

    // A long gap bottoms out at the configured floor
    db.engine
        .scheduler()
        .run_once(Utc::now() + ChronoDuration::days(200))
        .unwrap();
    let strength = db.engine.graph().edge("a", "b").unwrap().unwrap().strength;
    assert!((strength - 0.2).abs() < 1e-9);
}

#[test]
fn test_concurrent_access_is_never_lost() {
    let db = TestDatabaseManager::new_temp();
    db.seed_records(20, Level::Episode);
    let store = Arc::clone(db.engine.store());
    const TOUCHES: u64 = 200;

    let toucher = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for _ in 0..TOUCHES {
                store.touch(&["seed-0005".to_string()], &[]).unwrap();
            }
        })
    };

    let start = Utc::now();
    for day in 1..=10 {
        db.engine
            .scheduler()
            .run_once(start + ChronoDuration::days(day))
            .unwrap();
    }
    toucher.join().unwrap();
    db.engine
        .scheduler()
        .run_once(start + ChronoDuration::days(11))
        .unwrap();

    let record = store.get("seed-0005").unwrap();
    assert_eq!(record.access_count, TOUCHES);
    assert!(record.importance_score < 0.5);
}

#[test]
fn test_run_is_recorded() {
    let db = TestDatabaseManager::new_temp();
    db.seed_records(1, Level::Episode);
    let relational = db.engine.store().relational();
    assert!(relational.last_consolidation_at().unwrap().is_none());

    db.engine.scheduler().run_once(Utc::now()).unwrap();
    assert!(relational.last_consolidation_at().unwrap().is_some());
}

#[tokio::test]
async fn test_background_scheduler_runs_and_stops() {
    let db = TestDatabaseManager::new_temp();
    db.seed_records(2, Level::Episode);

    let handle = db
        .engine
        .scheduler()
        .spawn_with_delay(Duration::from_secs(3600), Duration::from_millis(10));

    let relational = db.engine.store().relational();
    for _ in 0..100 {
        if relational.last_consolidation_at().unwrap().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(relational.last_consolidation_at().unwrap().is_some());

    handle.stop().await;
}
