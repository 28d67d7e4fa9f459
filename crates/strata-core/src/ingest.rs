//! Ingestion gateway
//!
//! Entry point for producers that feed the store in batches. Re-submitted ids
//! are skipped, so producers may resend freely. Each namespace keeps a
//! high-water mark written in the same transaction as the item that set it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{MemoryError, Result};
use crate::memory::{IngestItem, validate_id};
use crate::storage::ProgressMark;
use crate::store::{MemoryStore, PutContext, PutResult};

/// Cooperative cancellation flag, checked between items
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An item that could not be ingested
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub id: String,
    pub error: String,
}

/// Outcome of one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub namespace: String,
    pub ingested: usize,
    /// Already stored; not an error
    pub skipped: usize,
    pub failed: Vec<ItemFailure>,
    /// Stopped early; items after the last processed one were not attempted
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl BatchReport {
    pub fn processed(&self) -> usize {
        self.ingested + self.skipped + self.failed.len()
    }
}

/// A source of items for one namespace
///
/// Implemented by concrete producers (documents, commit histories, JSON
/// lines). The gateway depends only on this interface.
pub trait SourceProducer {
    fn namespace(&self) -> &str;

    /// Check the source is readable before anything is extracted
    fn validate_source(&self) -> Result<()>;

    /// Items newer than `since`, or everything when `since` is `None`
    fn extract_batch(&self, since: Option<&ProgressMark>) -> Result<Vec<IngestItem>>;

    /// The newest item the source currently holds, when it can tell cheaply
    fn latest_processed(&self) -> Option<ProgressMark> {
        None
    }
}

pub struct IngestionGateway {
    store: Arc<MemoryStore>,
}

impl IngestionGateway {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// Put every item not already stored, stopping early on cancellation
    ///
    /// Per-item failures are collected in the report; the batch continues.
    ///
    /// The mark timestamp only ever comes from the source. An item without a
    /// source timestamp advances `last_id` and carries the previous
    /// timestamp forward (the epoch when the namespace has none yet).
    pub fn ingest_batch(
        &self,
        namespace: &str,
        items: &[IngestItem],
        cancel: &CancelToken,
    ) -> Result<BatchReport> {
        validate_namespace(namespace)?;
        let start = Instant::now();
        let mut report = BatchReport {
            namespace: namespace.to_string(),
            ..Default::default()
        };
        let mut carried = self
            .get_latest_processed(namespace)
            .map(|mark| mark.last_timestamp);

        for item in items {
            if cancel.is_cancelled() {
                info!(namespace, processed = report.processed(), "Ingestion cancelled");
                report.cancelled = true;
                break;
            }

            let mark_time = item
                .payload
                .source_timestamp
                .or(carried)
                .unwrap_or(DateTime::UNIX_EPOCH);

            match self.ingest_item(namespace, item, mark_time) {
                Ok(true) => {
                    report.ingested += 1;
                    carried = Some(mark_time);
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(namespace, id = %item.id, "Failed to ingest item: {}", e);
                    report.failed.push(ItemFailure {
                        id: item.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            namespace,
            ingested = report.ingested,
            skipped = report.skipped,
            failed = report.failed.len(),
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "Batch ingested"
        );
        Ok(report)
    }

    /// True when written, false when the id was already stored
    fn ingest_item(
        &self,
        namespace: &str,
        item: &IngestItem,
        mark_time: DateTime<Utc>,
    ) -> Result<bool> {
        if self.store.contains(&item.id)? {
            debug!(namespace, id = %item.id, "Already ingested, skipping");
            return Ok(false);
        }

        let context = PutContext {
            namespace,
            progress: ProgressMark {
                last_id: item.id.clone(),
                last_timestamp: mark_time,
            },
        };
        match self.store.put_with(item, Some(context))? {
            PutResult::Created(_) => Ok(true),
            PutResult::Existing(_) => Ok(false),
        }
    }

    /// High-water mark of `namespace`, or `None` when there is no usable state
    ///
    /// Never fails: an unreadable store or corrupted mark means the producer
    /// should resend everything.
    pub fn get_latest_processed(&self, namespace: &str) -> Option<ProgressMark> {
        match self.store.relational().latest_progress(namespace) {
            Ok(mark) => mark,
            Err(e) => {
                warn!(namespace, "Ignoring unreadable progress state: {}", e);
                None
            }
        }
    }

    /// Validate, extract and ingest everything `producer` has since the last run
    ///
    /// `force_full` ignores the stored high-water mark and re-extracts the
    /// whole source; already stored items are still skipped.
    pub fn sync_source(
        &self,
        producer: &dyn SourceProducer,
        force_full: bool,
        cancel: &CancelToken,
    ) -> Result<BatchReport> {
        let namespace = producer.namespace();
        validate_namespace(namespace)?;
        producer.validate_source()?;

        let since = if force_full {
            None
        } else {
            self.get_latest_processed(namespace)
        };

        if let Some(mark) = &since {
            if producer.latest_processed().as_ref() == Some(mark) {
                info!(namespace, last_id = %mark.last_id, "Source is up to date");
                return Ok(BatchReport {
                    namespace: namespace.to_string(),
                    ..Default::default()
                });
            }
        }

        if cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }

        let items = producer.extract_batch(since.as_ref())?;
        debug!(
            namespace,
            items = items.len(),
            incremental = since.is_some(),
            "Extracted batch"
        );
        self.ingest_batch(namespace, &items, cancel)
    }
}

fn validate_namespace(namespace: &str) -> Result<()> {
    validate_id(namespace).map_err(|_| {
        MemoryError::Validation(format!("invalid source namespace '{}'", namespace))
    })
}
