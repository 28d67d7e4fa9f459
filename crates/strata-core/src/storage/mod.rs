//! Storage module - relational persistence
//!
//! [`RelationalStore`] is the transactional CRUD capability over memory
//! records, their edges, the durable vector copies and producer progress.
//! [`SqliteStore`] implements it on SQLite.

mod migrations;
mod sqlite;

pub use migrations::MIGRATIONS;
pub use sqlite::{DATABASE_FILE, SqliteStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consolidation::ConsolidationReport;
use crate::error::Result;
use crate::graph::BlendWeights;
use crate::memory::{ConnectionEdge, Level, MemoryRecord, MemoryStats, NewEdge};

/// High-water mark of an incremental producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMark {
    pub last_id: String,
    pub last_timestamp: DateTime<Utc>,
}

/// Outcome of a conditional insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same id already exists; nothing was written
    AlreadyExists,
}

/// Keyset cursor into a neighbor listing: the last `(strength, id)` seen
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborCursor {
    pub strength: f64,
    pub id: String,
}

/// Transactional store for records, edges, vectors and producer progress
///
/// Every method is atomic on its own. Implementations must be `Send + Sync`;
/// callers share one instance behind an `Arc`.
pub trait RelationalStore: Send + Sync {
    /// Insert the record, its vector copy, its edges and (optionally) the
    /// namespace progress mark in one transaction. Writes nothing when the id
    /// already exists.
    fn insert_memory(
        &self,
        record: &MemoryRecord,
        edges: &[NewEdge],
        progress: Option<(&str, &ProgressMark)>,
    ) -> Result<InsertOutcome>;

    fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>>;

    fn memory_exists(&self, id: &str) -> Result<bool>;

    /// Delete the row and every edge touching it in one transaction; returns
    /// the level of the removed record
    fn delete_memory(&self, id: &str) -> Result<Option<Level>>;

    /// Delete only if `version` still matches
    fn delete_memory_if_version(&self, id: &str, version: u64) -> Result<bool>;

    /// Create the edge, or blend the contribution into the stored strength
    fn upsert_edge(
        &self,
        edge: &NewEdge,
        weights: BlendWeights,
        now: DateTime<Utc>,
    ) -> Result<ConnectionEdge>;

    fn get_edge(&self, source_id: &str, target_id: &str) -> Result<Option<ConnectionEdge>>;

    /// Every stored edge with `id` as source or target
    fn edges_for(&self, id: &str) -> Result<Vec<ConnectionEdge>>;

    /// One page of `(neighbor, strength)` over both edge directions, ordered
    /// by strength descending then id ascending, strictly after `after`
    fn neighbors_page(
        &self,
        id: &str,
        after: Option<&NeighborCursor>,
        limit: usize,
    ) -> Result<Vec<(String, f64)>>;

    /// Bump access counters on records and activation counters on the
    /// undirected edges `(a, b)` in one transaction
    fn touch(&self, ids: &[String], edges: &[(String, String)], now: DateTime<Utc>) -> Result<()>;

    /// Persist consolidation fields if the stored version equals
    /// `expected_version`; the stored version is incremented
    fn update_if_version(&self, record: &MemoryRecord, expected_version: u64) -> Result<bool>;

    /// Record ids in ascending order, strictly after `after`
    fn list_ids(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>>;

    /// Durable vector copies, for index reconciliation
    fn vectors(&self) -> Result<Vec<(String, Level, Vec<f32>)>>;

    fn latest_progress(&self, namespace: &str) -> Result<Option<ProgressMark>>;

    fn stats(&self) -> Result<MemoryStats>;

    /// Decay edge strengths for the time elapsed since the later of their
    /// last activation and `since`; returns the number of edges changed
    fn decay_connections(
        &self,
        now: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
        rate: f64,
        min_strength: f64,
    ) -> Result<u64>;

    fn record_consolidation(&self, report: &ConsolidationReport) -> Result<()>;

    fn last_consolidation_at(&self) -> Result<Option<DateTime<Utc>>>;

    /// Reachability check
    fn ping(&self) -> Result<()>;
}
