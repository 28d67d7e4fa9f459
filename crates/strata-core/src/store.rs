//! Memory store
//!
//! Owns the two-phase write path across the vector index and the relational
//! store. A record is visible only when both halves exist:
//!
//! - `put`: index entry first, then relational row + edges in one
//!   transaction. A failed second phase deletes the index entry again.
//! - `remove`: relational row + edges first, then the index entry.
//! - `get` and `query_nearest` never return a record missing either half.
//!
//! Writes to the same id are serialized by a per-id lock; reads take no
//! per-id lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{MemoryError, Result, retry_with_backoff};
use crate::graph::{BlendWeights, ConnectionGraph};
use crate::index::VectorIndex;
use crate::memory::{
    EdgeType, IngestItem, Level, MemoryRecord, NewEdge, validate_id, validate_vector,
};
use crate::storage::{InsertOutcome, ProgressMark, RelationalStore};

/// Result of [`MemoryStore::put`]
#[derive(Debug, Clone, PartialEq)]
pub enum PutResult {
    /// The record was written by this call
    Created(MemoryRecord),
    /// A record with this id already existed and was left unchanged
    Existing(MemoryRecord),
}

impl PutResult {
    pub fn record(&self) -> &MemoryRecord {
        match self {
            PutResult::Created(r) | PutResult::Existing(r) => r,
        }
    }

    pub fn into_record(self) -> MemoryRecord {
        match self {
            PutResult::Created(r) | PutResult::Existing(r) => r,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, PutResult::Created(_))
    }
}

/// Outcome of reconciling the index against the relational store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Vectors re-added to the index from their durable copy
    pub restored: usize,
    /// Index entries deleted because no relational row exists
    pub orphans_removed: usize,
}

/// Namespace bookkeeping attached to a put by the ingestion gateway
pub(crate) struct PutContext<'a> {
    pub namespace: &'a str,
    pub progress: ProgressMark,
}

pub struct MemoryStore {
    index: Arc<dyn VectorIndex>,
    relational: Arc<dyn RelationalStore>,
    config: EngineConfig,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        relational: Arc<dyn RelationalStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        if index.dimensions() != config.dimensions {
            return Err(MemoryError::Init(format!(
                "index dimension {} does not match configured {}",
                index.dimensions(),
                config.dimensions
            )));
        }
        Ok(Self {
            index,
            relational,
            config,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn relational(&self) -> &Arc<dyn RelationalStore> {
        &self.relational
    }

    /// Graph handle sharing this store's relational backend
    pub fn graph(&self) -> ConnectionGraph {
        ConnectionGraph::new(
            Arc::clone(&self.relational),
            BlendWeights::from(&self.config.connections),
        )
    }

    // ========================================================================
    // PER-ID LOCKS
    // ========================================================================

    fn with_id_lock<T>(&self, id: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let slot = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| MemoryError::lock_poisoned("Id lock table"))?;
            Arc::clone(locks.entry(id.to_string()).or_default())
        };

        let result = {
            let _guard = slot
                .lock()
                .map_err(|_| MemoryError::lock_poisoned("Id"))?;
            f()
        };

        if let Ok(mut locks) = self.locks.lock() {
            // Table plus our clone: nobody else is waiting
            if Arc::strong_count(&slot) == 2 {
                locks.remove(id);
            }
        }
        result
    }

    // ========================================================================
    // WRITE PATH
    // ========================================================================

    /// Insert the item if its id is absent; otherwise return the stored record
    /// unchanged.
    pub fn put(&self, item: &IngestItem) -> Result<PutResult> {
        self.put_with(item, None)
    }

    pub(crate) fn put_with(
        &self,
        item: &IngestItem,
        context: Option<PutContext<'_>>,
    ) -> Result<PutResult> {
        item.validate(self.config.dimensions)?;

        self.with_id_lock(&item.id, || {
            if let Some(existing) = self.load_existing(&item.id)? {
                tracing::debug!(id = %item.id, "Put is a no-op, record exists");
                return Ok(PutResult::Existing(existing));
            }

            self.validate_references(item)?;

            let now = Utc::now();
            let mut record = MemoryRecord::from_item(
                item,
                now,
                self.config.default_importance,
                self.config.consolidation.episodic_decay_rate,
            );
            record.source_namespace = context.as_ref().map(|c| c.namespace.to_string());
            let edges = self.edges_for_item(item);
            let progress = context.as_ref().map(|c| (c.namespace, &c.progress));

            self.two_phase_insert(record, &edges, progress)
        })
    }

    /// Relational row for `id`, repairing a missing index entry in place
    fn load_existing(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let policy = self.config.retry;
        let Some(existing) = retry_with_backoff(&policy, "get_memory", || {
            self.relational.get_memory(id)
        })?
        else {
            return Ok(None);
        };

        let indexed = retry_with_backoff(&policy, "index_contains", || {
            Ok(self.index.contains(existing.level, id)?)
        })?;
        if !indexed {
            tracing::warn!(id, level = %existing.level, "Restoring missing index entry");
            retry_with_backoff(&policy, "index_upsert", || {
                Ok(self.index.upsert(existing.level, id, &existing.vector)?)
            })?;
        }
        Ok(Some(existing))
    }

    /// Parent and link targets must exist; the parent chain must be acyclic
    fn validate_references(&self, item: &IngestItem) -> Result<()> {
        let policy = self.config.retry;

        if let Some(parent_id) = &item.payload.parent_id {
            let mut visited: HashSet<String> = HashSet::new();
            visited.insert(item.id.clone());
            let mut current = Some(parent_id.clone());

            while let Some(id) = current {
                if !visited.insert(id.clone()) {
                    return Err(MemoryError::Validation(format!(
                        "parent chain of {} contains a cycle at {}",
                        item.id, id
                    )));
                }
                let record = retry_with_backoff(&policy, "get_memory", || {
                    self.relational.get_memory(&id)
                })?
                .ok_or_else(|| {
                    MemoryError::Validation(format!("unknown parent {} for {}", id, item.id))
                })?;
                current = record.parent_id;
            }
        }

        for link in &item.payload.links {
            let exists = retry_with_backoff(&policy, "memory_exists", || {
                self.relational.memory_exists(&link.target_id)
            })?;
            if !exists {
                return Err(MemoryError::Validation(format!(
                    "unknown link target {} for {}",
                    link.target_id, item.id
                )));
            }
        }
        Ok(())
    }

    fn edges_for_item(&self, item: &IngestItem) -> Vec<NewEdge> {
        let mut edges: Vec<NewEdge> = item
            .payload
            .links
            .iter()
            .map(|link| item.link_edge(link))
            .collect();
        if let Some(parent_id) = &item.payload.parent_id {
            edges.push(NewEdge {
                source_id: parent_id.clone(),
                target_id: item.id.clone(),
                strength: self.config.connections.parent_edge_strength,
                edge_type: EdgeType::Hierarchical,
            });
        }
        edges
    }

    fn two_phase_insert(
        &self,
        record: MemoryRecord,
        edges: &[NewEdge],
        progress: Option<(&str, &ProgressMark)>,
    ) -> Result<PutResult> {
        let policy = self.config.retry;
        let id = record.id.as_str();
        let level = record.level;

        for cycle in 1..=2 {
            // Phase 1: vector entry
            retry_with_backoff(&policy, "index_upsert", || {
                Ok(self.index.upsert(level, id, &record.vector)?)
            })?;

            // Phase 2: relational row + edges
            let phase2 = retry_with_backoff(&policy, "insert_memory", || {
                self.relational.insert_memory(&record, edges, progress)
            });

            match phase2 {
                Ok(InsertOutcome::Inserted) => {
                    tracing::debug!(id, %level, edges = edges.len(), "Stored memory");
                    return Ok(PutResult::Created(record));
                }
                Ok(InsertOutcome::AlreadyExists) => {
                    // Another process won the race; mirror its vector
                    let existing = self.relational.get_memory(id)?.ok_or_else(|| {
                        MemoryError::Consistency(format!("{} vanished after conflict", id))
                    })?;
                    retry_with_backoff(&policy, "index_upsert", || {
                        Ok(self.index.upsert(existing.level, id, &existing.vector)?)
                    })?;
                    if existing.level != level {
                        // Our phase-1 entry sits in a partition the winner never used
                        if let Err(e) = retry_with_backoff(&policy, "index_delete", || {
                            Ok(self.index.delete(level, id)?)
                        }) {
                            tracing::warn!(id, %level, "Stray index entry left for reconciliation: {}", e);
                        }
                    }
                    return Ok(PutResult::Existing(existing));
                }
                Err(e) => {
                    tracing::warn!(id, cycle, "Relational write failed, rolling back index entry: {}", e);
                    if let Err(rollback) = retry_with_backoff(&policy, "index_rollback", || {
                        Ok(self.index.delete(level, id)?)
                    }) {
                        tracing::error!(id, "Index rollback failed, entry left for reconciliation: {}", rollback);
                        return Err(MemoryError::StoreUnavailable(format!(
                            "write of {} failed and rollback failed: {}",
                            id, rollback
                        )));
                    }
                    if cycle == 2 {
                        return Err(MemoryError::StoreUnavailable(format!(
                            "write of {} rolled back after retry: {}",
                            id, e
                        )));
                    }
                }
            }
        }

        Err(MemoryError::StoreUnavailable(format!("write of {} did not complete", id)))
    }

    /// Delete the record and its edges, then its index entry.
    pub fn remove(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let policy = self.config.retry;

        self.with_id_lock(id, || {
            let level = retry_with_backoff(&policy, "delete_memory", || {
                self.relational.delete_memory(id)
            })?;

            match level {
                Some(level) => {
                    retry_with_backoff(&policy, "index_delete", || {
                        Ok(self.index.delete(level, id)?)
                    })?;
                    tracing::info!(id, %level, "Removed memory");
                    Ok(())
                }
                None => {
                    // No row; clear any orphaned index entry
                    let mut removed = false;
                    for level in Level::ALL {
                        removed |= retry_with_backoff(&policy, "index_delete", || {
                            Ok(self.index.delete(level, id)?)
                        })?;
                    }
                    if removed {
                        tracing::warn!(id, "Removed orphaned index entry");
                        Ok(())
                    } else {
                        Err(MemoryError::NotFound(id.to_string()))
                    }
                }
            }
        })
    }

    /// Remove only if the stored version still equals `version`
    pub fn remove_if_version(&self, id: &str, version: u64) -> Result<bool> {
        let policy = self.config.retry;

        self.with_id_lock(id, || {
            let Some(record) = retry_with_backoff(&policy, "get_memory", || {
                self.relational.get_memory(id)
            })?
            else {
                return Ok(false);
            };
            if record.version != version {
                return Ok(false);
            }
            let deleted = retry_with_backoff(&policy, "delete_memory_if_version", || {
                self.relational.delete_memory_if_version(id, version)
            })?;
            if deleted {
                retry_with_backoff(&policy, "index_delete", || {
                    Ok(self.index.delete(record.level, id)?)
                })?;
            }
            Ok(deleted)
        })
    }

    /// Record an access on each id and an activation on each used edge
    pub fn touch(&self, ids: &[String], edges: &[(String, String)]) -> Result<()> {
        let now = Utc::now();
        retry_with_backoff(&self.config.retry, "touch", || {
            self.relational.touch(ids, edges, now)
        })
    }

    /// Conditionally persist consolidation fields
    pub fn update_if_version(&self, record: &MemoryRecord, expected_version: u64) -> Result<bool> {
        retry_with_backoff(&self.config.retry, "update_if_version", || {
            self.relational.update_if_version(record, expected_version)
        })
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    /// Visible record or `NotFound`
    pub fn get(&self, id: &str) -> Result<MemoryRecord> {
        let policy = self.config.retry;
        let record = retry_with_backoff(&policy, "get_memory", || self.relational.get_memory(id))?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;

        let indexed = retry_with_backoff(&policy, "index_contains", || {
            Ok(self.index.contains(record.level, id)?)
        })?;
        if !indexed {
            return Err(MemoryError::NotFound(id.to_string()));
        }
        Ok(record)
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        match self.get(id) {
            Ok(_) => Ok(true),
            Err(MemoryError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Up to `k` visible `(id, similarity)` pairs at `level`
    pub fn query_nearest(&self, level: Level, probe: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        validate_vector(probe, self.config.dimensions)?;
        if k == 0 {
            return Ok(vec![]);
        }
        let policy = self.config.retry;

        let mut fetch = k;
        loop {
            let hits = retry_with_backoff(&policy, "index_query", || {
                Ok(self.index.query_nearest(level, probe, fetch)?)
            })?;
            let fetched = hits.len();

            let mut visible = Vec::with_capacity(k);
            for (id, score) in hits {
                let exists = retry_with_backoff(&policy, "memory_exists", || {
                    self.relational.memory_exists(&id)
                })?;
                if exists {
                    visible.push((id, score));
                    if visible.len() == k {
                        break;
                    }
                }
            }

            // Orphans displaced some hits; widen once the index has more to give
            if visible.len() < k && fetched == fetch && fetch < k * 4 {
                fetch *= 2;
                continue;
            }
            return Ok(visible);
        }
    }

    /// Record ids in ascending order, strictly after `after`
    pub fn list_ids(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        retry_with_backoff(&self.config.retry, "list_ids", || {
            self.relational.list_ids(after, limit)
        })
    }

    // ========================================================================
    // RECONCILIATION
    // ========================================================================

    /// Restore index entries from durable vectors and drop orphaned entries
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let policy = self.config.retry;
        let vectors = retry_with_backoff(&policy, "vectors", || self.relational.vectors())?;
        let mut report = ReconcileReport::default();

        let mut known: HashMap<Level, HashSet<String>> = HashMap::new();
        for (id, level, vector) in vectors {
            let present = self.index.contains(level, &id)?;
            if !present {
                retry_with_backoff(&policy, "index_upsert", || {
                    Ok(self.index.upsert(level, &id, &vector)?)
                })?;
                report.restored += 1;
            }
            known.entry(level).or_default().insert(id);
        }

        for level in Level::ALL {
            let indexed = self.index.ids(level)?;
            for id in indexed {
                let is_known = known.get(&level).map(|s| s.contains(&id)).unwrap_or(false);
                if !is_known {
                    retry_with_backoff(&policy, "index_delete", || {
                        Ok(self.index.delete(level, &id)?)
                    })?;
                    report.orphans_removed += 1;
                }
            }
        }

        if report.restored > 0 || report.orphans_removed > 0 {
            tracing::info!(
                restored = report.restored,
                orphans_removed = report.orphans_removed,
                "Reconciled vector index with relational store"
            );
        }
        Ok(report)
    }
}

// ============================================================================
// TESTS
// ============================================================================
