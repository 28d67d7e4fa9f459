//! Engine handle
//!
//! [`MemoryEngine`] is constructed once at startup and owns every component.
//! Its lifecycle is explicit: `open` migrates and reconciles, `close` stops
//! background work and flushes the index.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::activation::{ActivationEngine, QueryOutcome, QueryResult};
use crate::config::{ActivationConfig, EngineConfig};
use crate::consolidation::{ConsolidationScheduler, SchedulerHandle};
use crate::error::{MemoryError, Result};
use crate::graph::ConnectionGraph;
use crate::index::VectorIndex;
use crate::ingest::IngestionGateway;
use crate::memory::MemoryStats;
use crate::storage::{RelationalStore, SqliteStore};
use crate::store::{MemoryStore, ReconcileReport};

/// Subdirectory holding persisted index files
pub const VECTORS_DIR: &str = "vectors";

/// Store reachability, as reported by [`MemoryEngine::health`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub relational_ok: bool,
    pub index_ok: bool,
    /// Rows in the relational store; `None` when it is unreachable
    pub relational_count: Option<u64>,
    pub index_count: usize,
    pub scheduler_running: bool,
    pub warnings: Vec<String>,
}

pub struct MemoryEngine {
    config: EngineConfig,
    data_dir: PathBuf,
    store: Arc<MemoryStore>,
    activation: ActivationEngine,
    gateway: IngestionGateway,
    scheduler: Arc<ConsolidationScheduler>,
    scheduler_handle: Mutex<Option<SchedulerHandle>>,
    reconciled: ReconcileReport,
}

impl MemoryEngine {
    /// Open the relational store under the configured data directory, wire
    /// it to `index`, and reconcile the two.
    pub fn open(config: EngineConfig, index: Arc<dyn VectorIndex>) -> Result<Self> {
        config.validate()?;
        let data_dir = config.resolve_data_dir()?;
        let relational: Arc<dyn RelationalStore> = Arc::new(SqliteStore::open_in_dir(&data_dir)?);
        Self::with_stores(config, data_dir, index, relational)
    }

    /// Open with the default index: HNSW persisted under `<data_dir>/vectors`
    /// when available, otherwise the exact flat index.
    pub fn open_default(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let data_dir = config.resolve_data_dir()?;
        let index = default_index(&data_dir, config.dimensions)?;
        let relational: Arc<dyn RelationalStore> = Arc::new(SqliteStore::open_in_dir(&data_dir)?);
        Self::with_stores(config, data_dir, index, relational)
    }

    /// Assemble an engine from already opened stores
    pub fn with_stores(
        config: EngineConfig,
        data_dir: PathBuf,
        index: Arc<dyn VectorIndex>,
        relational: Arc<dyn RelationalStore>,
    ) -> Result<Self> {
        let store = Arc::new(MemoryStore::new(index, relational, config.clone())?);
        let reconciled = store.reconcile()?;

        let activation = ActivationEngine::new(Arc::clone(&store), config.activation.clone());
        let gateway = IngestionGateway::new(Arc::clone(&store));
        let scheduler = Arc::new(ConsolidationScheduler::new(Arc::clone(&store)));

        info!(
            data_dir = %data_dir.display(),
            dimensions = config.dimensions,
            indexed = store.index().len(),
            "Memory engine opened"
        );

        Ok(Self {
            config,
            data_dir,
            store,
            activation,
            gateway,
            scheduler,
            scheduler_handle: Mutex::new(None),
            reconciled,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn graph(&self) -> ConnectionGraph {
        self.store.graph()
    }

    pub fn activation(&self) -> &ActivationEngine {
        &self.activation
    }

    pub fn gateway(&self) -> &IngestionGateway {
        &self.gateway
    }

    pub fn scheduler(&self) -> &Arc<ConsolidationScheduler> {
        &self.scheduler
    }

    /// What reconciliation repaired when the engine was opened
    pub fn reconciled(&self) -> &ReconcileReport {
        &self.reconciled
    }

    /// Activation query; `None` uses the configured defaults
    pub fn query(&self, probe: &[f32], params: Option<&ActivationConfig>) -> Result<Vec<QueryResult>> {
        match params {
            Some(params) => self.activation.query_with(probe, params),
            None => self.activation.query(probe),
        }
    }

    /// Activation query that also reports whether access was recorded
    pub fn query_outcome(
        &self,
        probe: &[f32],
        params: Option<&ActivationConfig>,
    ) -> Result<QueryOutcome> {
        let params = params.unwrap_or(self.activation.defaults());
        self.activation.query_outcome(probe, params)
    }

    pub fn remove_record(&self, id: &str) -> Result<()> {
        self.store.remove(id)
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        self.store.relational().stats()
    }

    /// Never fails; unreachable stores are reported, not raised
    pub fn health(&self) -> HealthReport {
        let mut warnings = Vec::new();

        let relational_ok = match self.store.relational().ping() {
            Ok(()) => true,
            Err(e) => {
                warnings.push(format!("relational store unreachable: {}", e));
                false
            }
        };
        let index_ok = match self.store.index().ping() {
            Ok(()) => true,
            Err(e) => {
                warnings.push(format!("vector index unreachable: {}", e));
                false
            }
        };

        let relational_count = if relational_ok {
            match self.store.relational().stats() {
                Ok(stats) => Some(stats.total_memories),
                Err(e) => {
                    warnings.push(format!("could not count records: {}", e));
                    None
                }
            }
        } else {
            None
        };
        let index_count = self.store.index().len();

        if let Some(count) = relational_count {
            if count as usize != index_count {
                warnings.push(format!(
                    "index holds {} entries for {} records; reopen to reconcile",
                    index_count, count
                ));
            }
        }

        HealthReport {
            healthy: relational_ok && index_ok,
            relational_ok,
            index_ok,
            relational_count,
            index_count,
            scheduler_running: self.scheduler_running(),
            warnings,
        }
    }

    // ========================================================================
    // BACKGROUND CONSOLIDATION
    // ========================================================================

    /// Start periodic consolidation at the configured interval.
    ///
    /// Must be called from within a tokio runtime. No-op when already running.
    pub fn start_scheduler(&self) -> Result<()> {
        let mut slot = self
            .scheduler_handle
            .lock()
            .map_err(|_| MemoryError::lock_poisoned("Scheduler"))?;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!("Consolidation scheduler already running");
            return Ok(());
        }
        let interval = self.config.consolidation.interval;
        info!(interval_secs = interval.as_secs(), "Starting consolidation scheduler");
        *slot = Some(self.scheduler.spawn(interval));
        Ok(())
    }

    /// Detach the running scheduler so the caller can await its shutdown
    pub fn take_scheduler(&self) -> Option<SchedulerHandle> {
        self.scheduler_handle.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn scheduler_running(&self) -> bool {
        self.scheduler_handle
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Signal the scheduler to stop and persist the index
    pub fn close(&self) -> Result<()> {
        if let Some(handle) = self.take_scheduler() {
            handle.shutdown();
        }
        self.store.index().flush()?;
        info!("Memory engine closed");
        Ok(())
    }
}

#[cfg(feature = "vector-search")]
fn default_index(data_dir: &std::path::Path, dimensions: usize) -> Result<Arc<dyn VectorIndex>> {
    use crate::index::{HnswConfig, HnswIndex};
    let index = HnswIndex::open(data_dir.join(VECTORS_DIR), HnswConfig::new(dimensions))?;
    Ok(Arc::new(index))
}

#[cfg(not(feature = "vector-search"))]
fn default_index(_data_dir: &std::path::Path, dimensions: usize) -> Result<Arc<dyn VectorIndex>> {
    Ok(Arc::new(crate::index::FlatIndex::new(dimensions)))
}
