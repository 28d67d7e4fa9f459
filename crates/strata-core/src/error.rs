//! Error taxonomy and retry policy
//!
//! Every fallible operation in the crate returns [`Result`]. IO against the
//! vector index or the relational store is wrapped in [`retry_with_backoff`]
//! at the `MemoryStore` boundary; exhaustion surfaces as
//! [`MemoryError::StoreUnavailable`].

use std::time::Duration;

use crate::index::VectorSearchError;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Memory engine error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Malformed input rejected before any write (bad id, wrong dimension,
    /// self-loop edge, cyclic parent chain)
    #[error("Validation error: {0}")]
    Validation(String),
    /// Record not found
    #[error("Memory not found: {0}")]
    NotFound(String),
    /// A two-phase write was only partially applied and has been rolled back
    #[error("Consistency error: {0}")]
    Consistency(String),
    /// Store IO failed after all retries
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    /// Persisted state could not be decoded
    #[error("Corrupted state: {0}")]
    CorruptedState(String),
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Vector index error
    #[error("Vector index error: {0}")]
    Index(#[from] VectorSearchError),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Initialization error (lock poisoning, bad configuration at open)
    #[error("Initialization error: {0}")]
    Init(String),
    /// The operation was cancelled between items
    #[error("Operation cancelled")]
    Cancelled,
}

impl MemoryError {
    /// Whether retrying the same call may succeed.
    ///
    /// Input errors and lookups are deterministic; store IO is not.
    pub fn is_transient(&self) -> bool {
        match self {
            MemoryError::Database(rusqlite::Error::SqliteFailure(err, _)) => !matches!(
                err.code,
                rusqlite::ErrorCode::ConstraintViolation
                    | rusqlite::ErrorCode::TypeMismatch
                    | rusqlite::ErrorCode::ApiMisuse
            ),
            MemoryError::Database(_) => false,
            MemoryError::Index(VectorSearchError::InvalidDimensions(..)) => false,
            MemoryError::Index(_) | MemoryError::Io(_) | MemoryError::Consistency(_) => true,
            _ => false,
        }
    }

    pub(crate) fn lock_poisoned(what: &str) -> Self {
        MemoryError::Init(format!("{} lock poisoned", what))
    }
}

/// Result type for memory engine operations
pub type Result<T> = std::result::Result<T, MemoryError>;

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
    /// Backoff growth factor between attempts
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Backoff before attempt `attempt` (1-based; attempt 1 never waits)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1).saturating_pow(attempt - 2);
        self.initial_backoff.saturating_mul(factor)
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy is
/// exhausted. Exhaustion of a transient failure becomes `StoreUnavailable`.
pub fn retry_with_backoff<T, F>(policy: &RetryPolicy, op_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt < max_attempts => {
                attempt += 1;
                let backoff = policy.backoff_for(attempt);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    "Store operation failed, retrying: {}",
                    e
                );
                std::thread::sleep(backoff);
            }
            Err(e) => {
                tracing::error!(
                    op = op_name,
                    attempts = attempt,
                    "Store operation failed permanently: {}",
                    e
                );
                return Err(MemoryError::StoreUnavailable(format!("{}: {}", op_name, e)));
            }
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

// ============================================================================
// TESTS
// ============================================================================
