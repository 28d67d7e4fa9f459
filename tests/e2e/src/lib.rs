//! End-to-end test support for Strata
//!
//! - `harness`: isolated engines on temporary databases with fault injection
//! - `mocks`: vectors, items and graph scenarios

pub mod harness;

pub use harness::{FailingIndex, TestDatabaseManager};
pub use mocks::{DIMS, TestDataFactory, axis, unit_at_angle};
