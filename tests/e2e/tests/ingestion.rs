//! Ingestion gateway: deduplication, progress marks and cancellation

use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use strata_core::{
    CancelToken, IngestItem, Level, MemoryError, ProgressMark, SourceProducer, deterministic_id,
};
use strata_e2e_tests::{TestDatabaseManager, axis};

fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap()
}

fn item(id: &str, day: u32) -> IngestItem {
    let mut item = IngestItem::new(id, format!("content of {}", id), axis(day as usize), Level::Episode);
    item.payload.source_timestamp = Some(at(day));
    item
}

/// In-memory producer that filters by timestamp and records every `since`
struct VecProducer {
    namespace: String,
    items: Vec<IngestItem>,
    calls: Mutex<Vec<Option<String>>>,
    cancel_during_extract: Option<CancelToken>,
}

impl VecProducer {
    fn new(namespace: &str, items: Vec<IngestItem>) -> Self {
        Self {
            namespace: namespace.to_string(),
            items,
            calls: Mutex::new(Vec::new()),
            cancel_during_extract: None,
        }
    }

    fn calls(&self) -> Vec<Option<String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl SourceProducer for VecProducer {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn validate_source(&self) -> strata_core::Result<()> {
        Ok(())
    }

    fn extract_batch(&self, since: Option<&ProgressMark>) -> strata_core::Result<Vec<IngestItem>> {
        self.calls
            .lock()
            .unwrap()
            .push(since.map(|m| m.last_id.clone()));
        if let Some(token) = &self.cancel_during_extract {
            token.cancel();
        }
        Ok(self
            .items
            .iter()
            .filter(|item| match (since, item.payload.source_timestamp) {
                (Some(mark), Some(ts)) => ts > mark.last_timestamp,
                _ => true,
            })
            .cloned()
            .collect())
    }
}

#[test]
fn test_reingest_is_noop_and_keeps_mark() {
    let db = TestDatabaseManager::new_temp();
    let gateway = db.engine.gateway();
    let cancel = CancelToken::new();
    let id = deterministic_id("fact", "the sky is blue");
    assert!(id.starts_with("fact::"));

    let mut fact = IngestItem::new(id.clone(), "the sky is blue", axis(0), Level::Episode);
    fact.payload.source_timestamp = Some(at(1));

    let first = gateway.ingest_batch("facts", &[fact.clone()], &cancel).unwrap();
    assert_eq!(first.ingested, 1);
    let mark = gateway.get_latest_processed("facts").unwrap();
    assert_eq!(mark.last_id, id);
    assert_eq!(mark.last_timestamp, at(1));

    fact.payload.source_timestamp = Some(at(9));
    let second = gateway.ingest_batch("facts", &[fact], &cancel).unwrap();
    assert_eq!(second.ingested, 0);
    assert_eq!(second.skipped, 1);
    assert_eq!(db.record_count(), 1);
    assert_eq!(gateway.get_latest_processed("facts").unwrap(), mark);

    let record = db.engine.store().get(&id).unwrap();
    assert_eq!(record.source_namespace.as_deref(), Some("facts"));
}

#[test]
fn test_namespaces_track_progress_independently() {
    let db = TestDatabaseManager::new_temp();
    let gateway = db.engine.gateway();
    let cancel = CancelToken::new();

    gateway.ingest_batch("one", &[item("a", 1)], &cancel).unwrap();
    gateway.ingest_batch("two", &[item("b", 2), item("c", 3)], &cancel).unwrap();

    assert_eq!(gateway.get_latest_processed("one").unwrap().last_id, "a");
    assert_eq!(gateway.get_latest_processed("two").unwrap().last_id, "c");
    assert!(gateway.get_latest_processed("three").is_none());
}

#[test]
fn test_incremental_sync_uses_mark() {
    let db = TestDatabaseManager::new_temp();
    let gateway = db.engine.gateway();
    let cancel = CancelToken::new();

    let producer = VecProducer::new("feed", vec![item("a", 1), item("b", 2)]);
    let report = gateway.sync_source(&producer, false, &cancel).unwrap();
    assert_eq!(report.ingested, 2);

    let producer = VecProducer::new("feed", vec![item("a", 1), item("b", 2), item("c", 3)]);
    let report = gateway.sync_source(&producer, false, &cancel).unwrap();
    assert_eq!(report.ingested, 1);
    assert_eq!(report.skipped, 0);
    assert_eq!(producer.calls(), vec![Some("b".to_string())]);
    assert_eq!(gateway.get_latest_processed("feed").unwrap().last_id, "c");
    assert_eq!(db.record_count(), 3);
}

#[test]
fn test_force_full_rescans_without_duplicates() {
    let db = TestDatabaseManager::new_temp();
    let gateway = db.engine.gateway();
    let cancel = CancelToken::new();
    let producer = VecProducer::new("feed", vec![item("a", 1), item("b", 2)]);

    gateway.sync_source(&producer, false, &cancel).unwrap();
    let report = gateway.sync_source(&producer, true, &cancel).unwrap();

    assert_eq!(report.ingested, 0);
    assert_eq!(report.skipped, 2);
    assert_eq!(producer.calls(), vec![None, None]);
    assert_eq!(db.record_count(), 2);
}

#[test]
fn test_cancel_during_extraction_ingests_nothing() {
    let db = TestDatabaseManager::new_temp();
    let gateway = db.engine.gateway();
    let cancel = CancelToken::new();

    let mut producer = VecProducer::new("feed", vec![item("a", 1), item("b", 2)]);
    producer.cancel_during_extract = Some(cancel.clone());

    let report = gateway.sync_source(&producer, false, &cancel).unwrap();
    assert!(report.cancelled);
    assert_eq!(report.processed(), 0);
    assert!(db.is_empty());
    assert!(gateway.get_latest_processed("feed").is_none());
}

#[test]
fn test_cancel_before_sync_is_an_error() {
    let db = TestDatabaseManager::new_temp();
    let cancel = CancelToken::new();
    cancel.cancel();

    let producer = VecProducer::new("feed", vec![item("a", 1)]);
    let result = db.engine.gateway().sync_source(&producer, false, &cancel);
    assert!(matches!(result, Err(MemoryError::Cancelled)));
    assert!(producer.calls().is_empty());
}

#[test]
fn test_failed_item_does_not_advance_mark() {
    let db = TestDatabaseManager::new_temp();
    let gateway = db.engine.gateway();
    db.inject_insert_failure("b");

    let report = gateway
        .ingest_batch("feed", &[item("a", 1), item("b", 2)], &CancelToken::new())
        .unwrap();
    assert_eq!(report.ingested, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, "b");
    assert_eq!(gateway.get_latest_processed("feed").unwrap().last_id, "a");
}

#[test]
fn test_corrupted_mark_reads_as_none() {
    let db = TestDatabaseManager::new_temp();
    let gateway = db.engine.gateway();
    gateway
        .ingest_batch("feed", &[item("a", 1)], &CancelToken::new())
        .unwrap();

    db.raw_connection()
        .execute(
            "UPDATE ingestion_progress SET last_timestamp = 'not a time' WHERE namespace = 'feed'",
            [],
        )
        .unwrap();
    assert!(gateway.get_latest_processed("feed").is_none());

    // A full sync still works and skips what is stored
    let producer = VecProducer::new("feed", vec![item("a", 1), item("b", 2)]);
    let report = gateway.sync_source(&producer, false, &CancelToken::new()).unwrap();
    assert_eq!(report.ingested, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(gateway.get_latest_processed("feed").unwrap().last_id, "b");
}

#[test]
fn test_invalid_namespace_rejected() {
    let db = TestDatabaseManager::new_temp();
    let result = db
        .engine
        .gateway()
        .ingest_batch("", &[item("a", 1)], &CancelToken::new());
    assert!(matches!(result, Err(MemoryError::Validation(_))));
    assert!(db.is_empty());
}
