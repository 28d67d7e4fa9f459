//! Concurrent writers and readers on one engine

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use strata_core::{IngestItem, Level, MemoryError, VectorIndex};
use strata_e2e_tests::{DIMS, TestDataFactory, TestDatabaseManager, axis};

const THREADS: usize = 8;

#[test]
fn test_concurrent_distinct_puts_all_land() {
    let db = TestDatabaseManager::new_temp();
    let store = Arc::clone(db.engine.store());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..25 {
                    let id = format!("t{}-{:03}", t, i);
                    let item = IngestItem::new(id.clone(), id, axis(t + i), Level::Episode);
                    assert!(store.put(&item).unwrap().was_created());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(db.record_count(), (THREADS * 25) as u64);
    assert_eq!(db.index.len(), THREADS * 25);
}

#[test]
fn test_concurrent_same_id_creates_once() {
    let db = TestDatabaseManager::new_temp();
    let store = Arc::clone(db.engine.store());
    let barrier = Arc::new(Barrier::new(THREADS));
    let created = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            let created = Arc::clone(&created);
            thread::spawn(move || {
                // Every writer claims different content; only one wins
                let mut item = TestDataFactory::concept("contested", axis(t));
                item.content = format!("writer {}", t);
                barrier.wait();
                let result = store.put(&item).unwrap();
                if result.was_created() {
                    created.fetch_add(1, Ordering::SeqCst);
                }
                result.into_record().content
            })
        })
        .collect();
    let seen: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(created.load(Ordering::SeqCst), 1);
    // Losers observe the winner's record
    let winner = db.engine.store().get("contested").unwrap();
    assert!(seen.iter().all(|content| *content == winner.content));
    assert_eq!(db.record_count(), 1);
    assert_eq!(db.index.len(), 1);
}

#[test]
fn test_readers_never_see_partial_writes() {
    let db = TestDatabaseManager::new_temp();
    let store = Arc::clone(db.engine.store());
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for i in 0..200 {
                let id = format!("w{:04}", i);
                store
                    .put(&TestDataFactory::concept(&id, axis(0)))
                    .unwrap();
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut observed = 0usize;
                while !done.load(Ordering::SeqCst) {
                    let hits = store.query_nearest(Level::Concept, &axis(0), 10).unwrap();
                    for (id, _) in hits {
                        // Anything the index returns must be fully readable
                        let record = store.get(&id).unwrap();
                        assert_eq!(record.vector.len(), DIMS);
                        observed += 1;
                    }
                }
                observed
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(db.record_count(), 200);
}

#[test]
fn test_queries_during_removal_skip_removed_records() {
    let db = TestDatabaseManager::new_temp();
    let ids = db.seed_records(64, Level::Concept);
    let store = Arc::clone(db.engine.store());

    let remover = {
        let store = Arc::clone(&store);
        let ids = ids.clone();
        thread::spawn(move || {
            for id in ids.iter().step_by(2) {
                store.remove(id).unwrap();
            }
        })
    };

    let engine = &db.engine;
    for _ in 0..50 {
        let results = engine.query(&axis(0), None).unwrap();
        for result in results {
            match engine.store().get(&result.id) {
                Ok(record) => assert_eq!(record.content, result.content),
                // Removed after the query returned it
                Err(MemoryError::NotFound(_)) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
    }
    remover.join().unwrap();

    assert_eq!(db.record_count(), 32);
    assert_eq!(db.index.len(), 32);
}

#[test]
fn test_stores_agree_after_mixed_workload() {
    let db = TestDatabaseManager::new_temp();
    let store = Arc::clone(db.engine.store());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..30 {
                    let id = format!("m{}-{:02}", t, i);
                    store
                        .put(&TestDataFactory::episode(&id, axis(i)))
                        .unwrap();
                    if i % 3 == 0 {
                        store.remove(&id).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let relational = db.record_count() as usize;
    assert_eq!(relational, 4 * 20);
    assert_eq!(db.index.len(), relational);
    assert_eq!(db.engine.health().relational_count, Some(relational as u64));
}
