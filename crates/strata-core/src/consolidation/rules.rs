//! Consolidation rules
//!
//! Pure state transitions applied to one record at a time:
//!
//! 1. **Decay**: `importance *= exp(-decay_rate * days)` for the days since the
//!    record was last decayed
//! 2. **Promotion**: episodic records with `access_count >= threshold` become
//!    semantic and take the slow decay rate
//! 3. **Retirement**: untouched episodic records below the importance floor and
//!    older than the TTL are removed; semantic records never are

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConsolidationConfig;
use crate::memory::{MemoryRecord, MemoryType, days_between};

// ============================================================================
// RULES
// ============================================================================

/// What consolidation would do to one record
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPlan {
    /// Record state after decay and promotion
    pub next: MemoryRecord,
    pub decayed: bool,
    pub promoted: bool,
    pub retire: bool,
}

impl RecordPlan {
    /// Whether anything needs writing
    pub fn is_noop(&self) -> bool {
        !self.decayed && !self.promoted && !self.retire
    }
}

/// Decay, promotion and retirement rules
#[derive(Debug, Clone, Default)]
pub struct ConsolidationRules {
    config: ConsolidationConfig,
}

impl ConsolidationRules {
    pub fn new(config: ConsolidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Exponential decay over `days_elapsed`
    pub fn decayed_importance(&self, importance: f64, decay_rate: f64, days_elapsed: f64) -> f64 {
        if days_elapsed <= 0.0 || decay_rate <= 0.0 {
            return importance;
        }
        importance * (-decay_rate * days_elapsed).exp()
    }

    pub fn should_promote(&self, record: &MemoryRecord) -> bool {
        record.memory_type == MemoryType::Episodic
            && record.access_count >= self.config.consolidation_threshold
    }

    /// Only episodic records qualify
    pub fn should_retire(&self, record: &MemoryRecord, now: DateTime<Utc>) -> bool {
        self.config.enable_retirement
            && record.memory_type == MemoryType::Episodic
            && record.importance_score < self.config.retirement_floor
            && record.access_count == 0
            && record.age_days(now) > self.config.retirement_ttl_days as f64
    }

    /// Next state for `record` at `now`
    pub fn evaluate(&self, record: &MemoryRecord, now: DateTime<Utc>) -> RecordPlan {
        let mut next = record.clone();

        let elapsed = days_between(record.last_decay_at, now);
        let decayed = elapsed > 0.0 && record.decay_rate > 0.0 && record.importance_score > 0.0;
        if decayed {
            next.importance_score =
                self.decayed_importance(record.importance_score, record.decay_rate, elapsed);
            next.last_decay_at = now;
        }

        let promoted = self.should_promote(&next);
        if promoted {
            next.memory_type = MemoryType::Semantic;
            next.decay_rate = self.config.semantic_decay_rate;
        }

        let retire = !promoted && self.should_retire(&next, now);

        RecordPlan {
            next,
            decayed,
            promoted,
            retire,
        }
    }

    /// Create a run tracker
    pub fn start_run(&self, dry_run: bool) -> ConsolidationRun {
        ConsolidationRun {
            started_at: Utc::now(),
            start_time: Instant::now(),
            dry_run,
            scanned: 0,
            decayed: 0,
            promoted: 0,
            retired: 0,
            version_conflicts: 0,
            connections_decayed: 0,
            errors: 0,
        }
    }
}

// ============================================================================
// RUN TRACKING
// ============================================================================

/// Summary of one consolidation scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Nothing was written
    pub dry_run: bool,
    pub scanned: u64,
    pub decayed: u64,
    pub promoted: u64,
    pub retired: u64,
    /// Records re-read after a concurrent update
    pub version_conflicts: u64,
    pub connections_decayed: u64,
    /// Records skipped after an error or exhausted retries
    pub errors: u64,
    pub duration_ms: u64,
}

/// Tracks a consolidation run in progress
pub struct ConsolidationRun {
    started_at: DateTime<Utc>,
    start_time: Instant,
    dry_run: bool,
    pub scanned: u64,
    pub decayed: u64,
    pub promoted: u64,
    pub retired: u64,
    pub version_conflicts: u64,
    pub connections_decayed: u64,
    pub errors: u64,
}

impl ConsolidationRun {
    /// Count the outcome of an applied (or planned) transition
    pub fn record_plan(&mut self, plan: &RecordPlan) {
        if plan.retire {
            self.retired += 1;
        }
        if plan.decayed {
            self.decayed += 1;
        }
        if plan.promoted {
            self.promoted += 1;
        }
    }

    pub fn record_scan(&mut self) {
        self.scanned += 1;
    }

    pub fn record_conflict(&mut self) {
        self.version_conflicts += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn record_connection_decay(&mut self, count: u64) {
        self.connections_decayed += count;
    }

    /// Finish the run and create a report
    pub fn finish(self) -> ConsolidationReport {
        ConsolidationReport {
            started_at: self.started_at,
            completed_at: Utc::now(),
            dry_run: self.dry_run,
            scanned: self.scanned,
            decayed: self.decayed,
            promoted: self.promoted,
            retired: self.retired,
            version_conflicts: self.version_conflicts,
            connections_decayed: self.connections_decayed,
            errors: self.errors,
            duration_ms: self.start_time.elapsed().as_millis() as u64,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
