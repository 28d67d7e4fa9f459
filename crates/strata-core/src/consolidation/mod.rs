//! Memory Consolidation Module
//!
//! Background ageing of the store:
//! - Decay importance over time
//! - Promote frequently accessed episodic memories to semantic
//! - Retire stale, untouched episodic memories
//! - Optionally decay unused connections

mod rules;
mod scheduler;

pub use rules::{ConsolidationReport, ConsolidationRules, ConsolidationRun, RecordPlan};
pub use scheduler::{ConsolidationScheduler, STARTUP_DELAY, SchedulerHandle};
