//! Database Migrations
//!
//! Schema migration definitions for the relational store.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: memories, connections, vectors, ingestion progress",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Consolidation run history",
        up: MIGRATION_V2_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    level TEXT NOT NULL,
    content TEXT NOT NULL,
    vector_ref TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    importance_score REAL NOT NULL DEFAULT 0.5,
    parent_id TEXT REFERENCES memories(id) ON DELETE SET NULL,
    memory_type TEXT NOT NULL DEFAULT 'episodic',
    decay_rate REAL NOT NULL,

    -- Optimistic concurrency and consolidation bookkeeping
    version INTEGER NOT NULL DEFAULT 1,
    last_decay_at TEXT NOT NULL,
    source_namespace TEXT
);

CREATE INDEX IF NOT EXISTS idx_memories_level ON memories(level);
CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(memory_type);
CREATE INDEX IF NOT EXISTS idx_memories_parent ON memories(parent_id);

CREATE TABLE IF NOT EXISTS memory_connections (
    source_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    strength REAL NOT NULL CHECK (strength >= 0.0 AND strength <= 1.0),
    type TEXT NOT NULL DEFAULT 'associative',
    created_at TEXT NOT NULL,
    last_activated TEXT,
    activation_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (source_id, target_id),
    CHECK (source_id <> target_id)
);

CREATE INDEX IF NOT EXISTS idx_connections_target ON memory_connections(target_id);

-- Durable copy of each vector, used to rebuild the index
CREATE TABLE IF NOT EXISTS memory_vectors (
    memory_id TEXT PRIMARY KEY REFERENCES memories(id) ON DELETE CASCADE,
    level TEXT NOT NULL,
    dimensions INTEGER NOT NULL,
    vector BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS ingestion_progress (
    namespace TEXT PRIMARY KEY,
    last_id TEXT NOT NULL,
    last_timestamp TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: Consolidation history, used by the scheduler to skip fresh runs
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS consolidation_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    scanned INTEGER NOT NULL DEFAULT 0,
    decayed INTEGER NOT NULL DEFAULT 0,
    promoted INTEGER NOT NULL DEFAULT 0,
    retired INTEGER NOT NULL DEFAULT 0,
    version_conflicts INTEGER NOT NULL DEFAULT 0,
    connections_decayed INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_consolidation_runs_completed ON consolidation_runs(completed_at);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (2, datetime('now'));
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations, returning how many ran
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}
