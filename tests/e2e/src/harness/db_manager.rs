//! Test Database Manager
//!
//! Provides isolated engine instances for testing:
//! - Temporary databases that are automatically cleaned up
//! - Pre-seeded databases with test data
//! - Fault injection on either store
//! - Reopening against the same files

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use strata_core::storage::DATABASE_FILE;
use strata_core::{
    EngineConfig, FlatIndex, IngestItem, Level, MemoryEngine, RetryPolicy, VectorIndex,
    VectorSearchError,
};
use tempfile::TempDir;

use crate::mocks::{DIMS, axis};

/// Flat index whose operations can be switched to fail
pub struct FailingIndex {
    inner: FlatIndex,
    pub fail_upsert: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_query: AtomicBool,
}

impl FailingIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            inner: FlatIndex::new(dimensions),
            fail_upsert: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            fail_query: AtomicBool::new(false),
        }
    }

    pub fn set_fail_upsert(&self, fail: bool) {
        self.fail_upsert.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_query(&self, fail: bool) {
        self.fail_query.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<(), VectorSearchError> {
        if flag.load(Ordering::SeqCst) {
            return Err(VectorSearchError::Unavailable(format!("injected {} failure", what)));
        }
        Ok(())
    }
}

impl VectorIndex for FailingIndex {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn upsert(&self, level: Level, id: &str, vector: &[f32]) -> Result<(), VectorSearchError> {
        Self::check(&self.fail_upsert, "upsert")?;
        self.inner.upsert(level, id, vector)
    }

    fn delete(&self, level: Level, id: &str) -> Result<bool, VectorSearchError> {
        Self::check(&self.fail_delete, "delete")?;
        self.inner.delete(level, id)
    }

    fn query_nearest(
        &self,
        level: Level,
        probe: &[f32],
        k: usize,
    ) -> Result<Vec<(String, f32)>, VectorSearchError> {
        Self::check(&self.fail_query, "query")?;
        self.inner.query_nearest(level, probe, k)
    }

    fn contains(&self, level: Level, id: &str) -> Result<bool, VectorSearchError> {
        self.inner.contains(level, id)
    }

    fn ids(&self, level: Level) -> Result<Vec<String>, VectorSearchError> {
        self.inner.ids(level)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn ping(&self) -> Result<(), VectorSearchError> {
        Self::check(&self.fail_query, "ping")
    }
}

/// Manager for test databases
///
/// Creates an isolated engine per test. The temporary directory is deleted
/// when the manager is dropped.
///
/// # Example
///
/// ```rust,ignore
/// let db = TestDatabaseManager::new_temp();
/// db.engine.store().put(&item)?;
/// db.index.set_fail_upsert(true);
/// ```
pub struct TestDatabaseManager {
    pub engine: MemoryEngine,
    /// The engine's index, for fault injection and inspection
    pub index: Arc<FailingIndex>,
    config: EngineConfig,
    _temp_dir: TempDir,
    data_dir: PathBuf,
}

impl TestDatabaseManager {
    /// Engine on a fresh temporary directory with fast retries
    pub fn new_temp() -> Self {
        Self::with_config(Self::test_config())
    }

    /// Fresh temporary directory; `config.data_dir` is overridden
    pub fn with_config(mut config: EngineConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let data_dir = temp_dir.path().to_path_buf();
        config.data_dir = Some(data_dir.clone());

        let index = Arc::new(FailingIndex::new(config.dimensions));
        let engine = MemoryEngine::open(config.clone(), index.clone())
            .expect("Failed to open test engine");

        Self {
            engine,
            index,
            config,
            _temp_dir: temp_dir,
            data_dir,
        }
    }

    /// Defaults with the test dimension and millisecond backoff
    pub fn test_config() -> EngineConfig {
        EngineConfig {
            dimensions: DIMS,
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                multiplier: 2,
            },
            ..Default::default()
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    /// Close and reopen on the same files with an empty index, as after a
    /// restart with a lost index
    pub fn reopen(&mut self) {
        let _ = self.engine.close();
        let index = Arc::new(FailingIndex::new(self.config.dimensions));
        self.engine = MemoryEngine::open(self.config.clone(), index.clone())
            .expect("Failed to reopen test engine");
        self.index = index;
    }

    /// Reopen keeping the current index contents
    pub fn reopen_with_index(&mut self) {
        let _ = self.engine.close();
        self.engine = MemoryEngine::open(self.config.clone(), self.index.clone())
            .expect("Failed to reopen test engine");
    }

    pub fn record_count(&self) -> u64 {
        self.engine
            .stats()
            .map(|s| s.total_memories)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    // ========================================================================
    // SEEDING METHODS
    // ========================================================================

    /// Seed `count` records at `level`, each on its own axis direction
    pub fn seed_records(&self, count: usize, level: Level) -> Vec<String> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let id = format!("seed-{:04}", i);
            let item = IngestItem::new(
                id.clone(),
                format!("Test memory content {}", i),
                axis(i % DIMS),
                level,
            );
            if self.engine.store().put(&item).is_ok() {
                ids.push(id);
            }
        }
        ids
    }

    // ========================================================================
    // FAULT INJECTION
    // ========================================================================

    /// Make every relational insert of `id` abort
    pub fn inject_insert_failure(&self, id: &str) {
        let conn = rusqlite::Connection::open(self.db_path()).expect("Failed to open database");
        conn.execute_batch(&format!(
            "CREATE TRIGGER {} BEFORE INSERT ON memories
             WHEN NEW.id = '{}'
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
            trigger_name(id),
            id.replace('\'', "''")
        ))
        .expect("Failed to install failure trigger");
    }

    pub fn clear_insert_failure(&self, id: &str) {
        let conn = rusqlite::Connection::open(self.db_path()).expect("Failed to open database");
        conn.execute_batch(&format!("DROP TRIGGER IF EXISTS {};", trigger_name(id)))
            .expect("Failed to drop failure trigger");
    }

    /// Raw connection for inspecting or corrupting persisted state
    pub fn raw_connection(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(self.db_path()).expect("Failed to open database")
    }
}

fn trigger_name(id: &str) -> String {
    let safe: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("fail_insert_{}", safe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_database_starts_empty() {
        let db = TestDatabaseManager::new_temp();
        assert!(db.is_empty());
        assert!(db.db_path().exists());
    }

    #[test]
    fn test_seed_records() {
        let db = TestDatabaseManager::new_temp();
        let ids = db.seed_records(5, Level::Episode);
        assert_eq!(ids.len(), 5);
        assert_eq!(db.record_count(), 5);
    }

    #[test]
    fn test_trigger_names_are_sanitized() {
        assert_eq!(trigger_name("fact::a-b"), "fail_insert_fact__a_b");
    }
}
