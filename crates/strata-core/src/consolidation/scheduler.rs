//! Consolidation scheduler
//!
//! Scans every record independently of query traffic. Each record is updated
//! under optimistic versioning: a concurrent touch bumps the version, the
//! conditional write fails, and only that record is re-read and retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::rules::{ConsolidationReport, ConsolidationRules, ConsolidationRun};
use crate::error::{MemoryError, Result, retry_with_backoff};
use crate::store::MemoryStore;

/// Ids read per page while scanning
const SCAN_PAGE_SIZE: usize = 500;

/// Delay before the first background run
pub const STARTUP_DELAY: Duration = Duration::from_secs(2);

pub struct ConsolidationScheduler {
    store: Arc<MemoryStore>,
    rules: ConsolidationRules,
}

impl ConsolidationScheduler {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        let rules = ConsolidationRules::new(store.config().consolidation.clone());
        Self { store, rules }
    }

    pub fn rules(&self) -> &ConsolidationRules {
        &self.rules
    }

    /// Apply decay, promotion and retirement to every record as of `now`
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<ConsolidationReport> {
        let report = self.scan(now, false)?;
        if let Err(e) = self.store.relational().record_consolidation(&report) {
            warn!("Failed to record consolidation run: {}", e);
        }
        info!(
            scanned = report.scanned,
            decayed = report.decayed,
            promoted = report.promoted,
            retired = report.retired,
            version_conflicts = report.version_conflicts,
            connections_decayed = report.connections_decayed,
            errors = report.errors,
            duration_ms = report.duration_ms,
            "Consolidation complete"
        );
        Ok(report)
    }

    /// What `run_once(now)` would do, writing nothing
    pub fn plan(&self, now: DateTime<Utc>) -> Result<ConsolidationReport> {
        self.scan(now, true)
    }

    fn scan(&self, now: DateTime<Utc>, dry_run: bool) -> Result<ConsolidationReport> {
        let mut run = self.rules.start_run(dry_run);
        let mut after: Option<String> = None;

        loop {
            let page = self.store.list_ids(after.as_deref(), SCAN_PAGE_SIZE)?;
            let Some(last) = page.last().cloned() else {
                break;
            };

            for id in &page {
                run.record_scan();
                if let Err(e) = self.consolidate_record(id, now, dry_run, &mut run) {
                    warn!(id = %id, "Skipping record this run: {}", e);
                    run.record_error();
                }
            }

            if page.len() < SCAN_PAGE_SIZE {
                break;
            }
            after = Some(last);
        }

        let rate = self.rules.config().connection_decay_rate;
        if !dry_run && rate > 0.0 {
            let relational = self.store.relational();
            let since = relational.last_consolidation_at().unwrap_or_else(|e| {
                warn!("Could not read consolidation history: {}", e);
                None
            });
            let min = self.rules.config().min_connection_strength;
            let changed = retry_with_backoff(&self.store.config().retry, "decay_connections", || {
                relational.decay_connections(now, since, rate, min)
            })?;
            run.record_connection_decay(changed);
        }

        Ok(run.finish())
    }

    fn consolidate_record(
        &self,
        id: &str,
        now: DateTime<Utc>,
        dry_run: bool,
        run: &mut ConsolidationRun,
    ) -> Result<()> {
        let max_retries = self.rules.config().max_version_retries;

        for attempt in 0..=max_retries {
            let record = match self.store.get(id) {
                Ok(record) => record,
                // Removed since the page was read
                Err(MemoryError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            };

            let plan = self.rules.evaluate(&record, now);
            if plan.is_noop() {
                return Ok(());
            }
            if dry_run {
                run.record_plan(&plan);
                return Ok(());
            }

            let applied = if plan.retire {
                self.store.remove_if_version(id, record.version)?
            } else {
                self.store.update_if_version(&plan.next, record.version)?
            };

            if applied {
                tracing::debug!(
                    id,
                    decayed = plan.decayed,
                    promoted = plan.promoted,
                    retired = plan.retire,
                    importance = plan.next.importance_score,
                    "Consolidated record"
                );
                run.record_plan(&plan);
                return Ok(());
            }

            run.record_conflict();
            tracing::debug!(id, attempt, "Version conflict, re-reading record");
        }

        Err(MemoryError::Consistency(format!(
            "{} kept changing after {} retries",
            id, max_retries
        )))
    }

    /// Run on a background task every `interval`
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> SchedulerHandle {
        self.spawn_with_delay(interval, STARTUP_DELAY)
    }

    /// Like [`spawn`](Self::spawn) with an explicit delay before the first check
    pub fn spawn_with_delay(self: &Arc<Self>, interval: Duration, delay: Duration) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => return,
            }

            loop {
                if scheduler.is_due(interval) {
                    let worker = Arc::clone(&scheduler);
                    match tokio::task::spawn_blocking(move || worker.run_once(Utc::now())).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!("Periodic consolidation failed: {}", e),
                        Err(e) => warn!("Periodic consolidation task panicked: {}", e),
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("Consolidation scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    /// False when the last recorded run is fresher than `interval`
    fn is_due(&self, interval: Duration) -> bool {
        match self.store.relational().last_consolidation_at() {
            Ok(Some(last)) => {
                let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX);
                let stale = Utc::now() - last >= interval;
                if !stale {
                    info!(last_consolidation = %last, "Skipping consolidation, last run is recent");
                }
                stale
            }
            Ok(None) => {
                info!("No previous consolidation found, running first consolidation");
                true
            }
            Err(e) => {
                warn!("Could not read consolidation history: {}, running anyway", e);
                true
            }
        }
    }
}

/// Handle to a background consolidation loop
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the loop to stop after the current run
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal and wait for the loop to exit
    pub async fn stop(self) {
        self.shutdown();
        if let Err(e) = self.task.await {
            warn!("Consolidation scheduler exited abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
