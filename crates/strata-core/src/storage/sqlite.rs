//! SQLite Storage Implementation
//!
//! Relational half of the dual store. Uses separate reader/writer connections
//! so every method takes `&self` and the store is `Send + Sync`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use super::migrations::apply_migrations;
use super::{InsertOutcome, NeighborCursor, ProgressMark, RelationalStore};
use crate::consolidation::ConsolidationReport;
use crate::error::{MemoryError, Result};
use crate::graph::{BlendWeights, blend};
use crate::memory::{ConnectionEdge, EdgeType, Level, MemoryRecord, MemoryStats, NewEdge};

/// Database file name inside the data directory
pub const DATABASE_FILE: &str = "strata.db";

const MEMORY_COLUMNS: &str = "m.id, m.level, m.content, m.created_at, m.last_accessed,
    m.access_count, m.importance_score, m.parent_id, m.memory_type, m.decay_rate,
    m.version, m.last_decay_at, m.source_namespace, v.vector";

const EDGE_COLUMNS: &str =
    "source_id, target_id, strength, type, created_at, last_activated, activation_count";

// ============================================================================
// STORE
// ============================================================================

/// SQLite-backed [`RelationalStore`]
pub struct SqliteStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    /// Apply PRAGMAs and optional encryption to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        #[cfg(feature = "encryption")]
        {
            if let Ok(key) = std::env::var("STRATA_ENCRYPTION_KEY") {
                if !key.is_empty() {
                    conn.pragma_update(None, "key", &key)?;
                }
            }
        }

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -16000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;

        Ok(())
    }

    /// Open (or create) the database at `path` and apply migrations
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer = Connection::open(&path)?;
        Self::configure_connection(&writer)?;
        let applied = apply_migrations(&writer)?;
        if applied > 0 {
            tracing::info!(path = %path.display(), applied, "Database schema migrated");
        }

        let reader = Connection::open(&path)?;
        Self::configure_connection(&reader)?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            path,
        })
    }

    /// Open the database file inside a data directory
    pub fn open_in_dir(dir: &Path) -> Result<Self> {
        Self::open(dir.join(DATABASE_FILE))
    }

    /// Location of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| MemoryError::lock_poisoned("Writer"))
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| MemoryError::lock_poisoned("Reader"))
    }

    /// Delete every edge where `id` is source or target
    fn remove_node_edges(tx: &Transaction<'_>, id: &str) -> rusqlite::Result<usize> {
        tx.execute(
            "DELETE FROM memory_connections WHERE source_id = ?1 OR target_id = ?1",
            params![id],
        )
    }

    fn select_edge(
        conn: &Connection,
        source_id: &str,
        target_id: &str,
    ) -> rusqlite::Result<Option<ConnectionEdge>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM memory_connections WHERE source_id = ?1 AND target_id = ?2",
                EDGE_COLUMNS
            ),
            params![source_id, target_id],
            row_to_edge,
        )
        .optional()
    }
}

impl RelationalStore for SqliteStore {
    fn insert_memory(
        &self,
        record: &MemoryRecord,
        edges: &[NewEdge],
        progress: Option<(&str, &ProgressMark)>,
    ) -> Result<InsertOutcome> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM memories WHERE id = ?1)",
            params![record.id],
            |row| row.get(0),
        )?;
        if exists {
            return Ok(InsertOutcome::AlreadyExists);
        }

        tx.execute(
            "INSERT INTO memories (
                id, level, content, vector_ref, created_at, last_accessed, access_count,
                importance_score, parent_id, memory_type, decay_rate, version,
                last_decay_at, source_namespace
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.id,
                record.level.as_str(),
                record.content,
                record.vector_ref(),
                record.created_at.to_rfc3339(),
                record.last_accessed_at.to_rfc3339(),
                record.access_count as i64,
                record.importance_score,
                record.parent_id,
                record.memory_type.as_str(),
                record.decay_rate,
                record.version as i64,
                record.last_decay_at.to_rfc3339(),
                record.source_namespace,
            ],
        )?;

        tx.execute(
            "INSERT INTO memory_vectors (memory_id, level, dimensions, vector)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id,
                record.level.as_str(),
                record.vector.len() as i64,
                encode_vector(&record.vector),
            ],
        )?;

        let created = record.created_at.to_rfc3339();
        for edge in edges {
            tx.execute(
                "INSERT INTO memory_connections (source_id, target_id, strength, type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    edge.source_id,
                    edge.target_id,
                    edge.strength,
                    edge.edge_type.as_str(),
                    created
                ],
            )?;
        }

        if let Some((namespace, mark)) = progress {
            tx.execute(
                "INSERT INTO ingestion_progress (namespace, last_id, last_timestamp, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(namespace) DO UPDATE SET
                    last_id = excluded.last_id,
                    last_timestamp = excluded.last_timestamp,
                    updated_at = excluded.updated_at",
                params![
                    namespace,
                    mark.last_id,
                    mark.last_timestamp.to_rfc3339(),
                    Utc::now().to_rfc3339()
                ],
            )?;
        }

        tx.commit()?;
        Ok(InsertOutcome::Inserted)
    }

    fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let reader = self.reader()?;
        let record = reader
            .query_row(
                &format!(
                    "SELECT {} FROM memories m
                     LEFT JOIN memory_vectors v ON v.memory_id = m.id
                     WHERE m.id = ?1",
                    MEMORY_COLUMNS
                ),
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn memory_exists(&self, id: &str) -> Result<bool> {
        let reader = self.reader()?;
        let exists = reader.query_row(
            "SELECT EXISTS(SELECT 1 FROM memories WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn delete_memory(&self, id: &str) -> Result<Option<Level>> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let level: Option<String> = tx
            .query_row(
                "SELECT level FROM memories WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(level) = level else {
            return Ok(None);
        };
        let level = parse_enum::<Level>(&level, "level")?;

        let edges = Self::remove_node_edges(&tx, id)?;
        tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        tx.commit()?;

        tracing::debug!(id, %level, edges, "Deleted memory row");
        Ok(Some(level))
    }

    fn delete_memory_if_version(&self, id: &str, version: u64) -> Result<bool> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT version FROM memories WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if current != Some(version as i64) {
            return Ok(false);
        }

        Self::remove_node_edges(&tx, id)?;
        tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(true)
    }

    fn upsert_edge(
        &self,
        edge: &NewEdge,
        weights: BlendWeights,
        now: DateTime<Utc>,
    ) -> Result<ConnectionEdge> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let existing: Option<f64> = tx
            .query_row(
                "SELECT strength FROM memory_connections WHERE source_id = ?1 AND target_id = ?2",
                params![edge.source_id, edge.target_id],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => {
                tx.execute(
                    "INSERT INTO memory_connections (source_id, target_id, strength, type, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        edge.source_id,
                        edge.target_id,
                        edge.strength,
                        edge.edge_type.as_str(),
                        now.to_rfc3339()
                    ],
                )?;
            }
            Some(current) => {
                let strength = blend(current, edge.strength, weights);
                tx.execute(
                    "UPDATE memory_connections SET strength = ?3
                     WHERE source_id = ?1 AND target_id = ?2",
                    params![edge.source_id, edge.target_id, strength],
                )?;
            }
        }

        let stored = Self::select_edge(&tx, &edge.source_id, &edge.target_id)?
            .ok_or_else(|| MemoryError::NotFound(format!("{}->{}", edge.source_id, edge.target_id)))?;
        tx.commit()?;
        Ok(stored)
    }

    fn get_edge(&self, source_id: &str, target_id: &str) -> Result<Option<ConnectionEdge>> {
        let reader = self.reader()?;
        Ok(Self::select_edge(&reader, source_id, target_id)?)
    }

    fn edges_for(&self, id: &str) -> Result<Vec<ConnectionEdge>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM memory_connections
             WHERE source_id = ?1 OR target_id = ?1
             ORDER BY strength DESC, source_id, target_id",
            EDGE_COLUMNS
        ))?;
        let edges = stmt
            .query_map(params![id], row_to_edge)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    fn neighbors_page(
        &self,
        id: &str,
        after: Option<&NeighborCursor>,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare_cached(
            "SELECT neighbor, strength FROM (
                SELECT neighbor, MAX(strength) AS strength FROM (
                    SELECT target_id AS neighbor, strength FROM memory_connections WHERE source_id = ?1
                    UNION ALL
                    SELECT source_id AS neighbor, strength FROM memory_connections WHERE target_id = ?1
                ) GROUP BY neighbor
             )
             WHERE ?2 IS NULL OR strength < ?2 OR (strength = ?2 AND neighbor > ?3)
             ORDER BY strength DESC, neighbor ASC
             LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![
                    id,
                    after.map(|c| c.strength),
                    after.map(|c| c.id.as_str()),
                    limit as i64
                ],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn touch(&self, ids: &[String], edges: &[(String, String)], now: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() && edges.is_empty() {
            return Ok(());
        }
        let now = now.to_rfc3339();
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        {
            let mut touch_record = tx.prepare_cached(
                "UPDATE memories
                 SET access_count = access_count + 1, last_accessed = ?2, version = version + 1
                 WHERE id = ?1",
            )?;
            for id in ids {
                touch_record.execute(params![id, now])?;
            }

            let mut touch_edge = tx.prepare_cached(
                "UPDATE memory_connections
                 SET activation_count = activation_count + 1, last_activated = ?3
                 WHERE (source_id = ?1 AND target_id = ?2) OR (source_id = ?2 AND target_id = ?1)",
            )?;
            for (a, b) in edges {
                touch_edge.execute(params![a, b, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn update_if_version(&self, record: &MemoryRecord, expected_version: u64) -> Result<bool> {
        let writer = self.writer()?;
        let rows = writer.execute(
            "UPDATE memories
             SET importance_score = ?3, memory_type = ?4, decay_rate = ?5,
                 last_decay_at = ?6, version = version + 1
             WHERE id = ?1 AND version = ?2",
            params![
                record.id,
                expected_version as i64,
                record.importance_score,
                record.memory_type.as_str(),
                record.decay_rate,
                record.last_decay_at.to_rfc3339(),
            ],
        )?;
        Ok(rows == 1)
    }

    fn list_ids(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare_cached(
            "SELECT id FROM memories WHERE ?1 IS NULL OR id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![after, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    fn vectors(&self) -> Result<Vec<(String, Level, Vec<f32>)>> {
        let reader = self.reader()?;
        let mut stmt =
            reader.prepare("SELECT memory_id, level, vector FROM memory_vectors ORDER BY memory_id")?;
        let rows = stmt
            .query_map([], |row| {
                let level: String = row.get(1)?;
                let blob: Vec<u8> = row.get(2)?;
                Ok((
                    row.get::<_, String>(0)?,
                    parse_enum::<Level>(&level, "level")?,
                    decode_vector(&blob)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn latest_progress(&self, namespace: &str) -> Result<Option<ProgressMark>> {
        let reader = self.reader()?;
        let row: Option<(String, String)> = reader
            .query_row(
                "SELECT last_id, last_timestamp FROM ingestion_progress WHERE namespace = ?1",
                params![namespace],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((last_id, last_timestamp)) = row else {
            return Ok(None);
        };
        let last_timestamp = DateTime::parse_from_rfc3339(&last_timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                MemoryError::CorruptedState(format!(
                    "progress for {} has invalid timestamp '{}': {}",
                    namespace, last_timestamp, e
                ))
            })?;
        Ok(Some(ProgressMark {
            last_id,
            last_timestamp,
        }))
    }

    fn stats(&self) -> Result<MemoryStats> {
        let reader = self.reader()?;

        let (total, average, oldest, newest): (i64, f64, Option<String>, Option<String>) = reader
            .query_row(
                "SELECT COUNT(*), COALESCE(AVG(importance_score), 0.0),
                        MIN(created_at), MAX(created_at)
                 FROM memories",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        let mut stats = MemoryStats {
            total_memories: total.max(0) as u64,
            average_importance: average,
            oldest_memory: oldest.map(|s| parse_timestamp(&s, "created_at")).transpose()?,
            newest_memory: newest.map(|s| parse_timestamp(&s, "created_at")).transpose()?,
            ..Default::default()
        };

        let mut stmt = reader.prepare("SELECT level, COUNT(*) FROM memories GROUP BY level")?;
        let by_level = stmt
            .query_map([], |row| {
                let level: String = row.get(0)?;
                Ok((parse_enum::<Level>(&level, "level")?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (level, count) in by_level {
            stats.memories_by_level.insert(level, count.max(0) as u64);
        }

        let mut stmt =
            reader.prepare("SELECT memory_type, COUNT(*) FROM memories GROUP BY memory_type")?;
        let by_type = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (memory_type, count) in by_type {
            stats.memories_by_type.insert(memory_type, count.max(0) as u64);
        }

        let connections: i64 =
            reader.query_row("SELECT COUNT(*) FROM memory_connections", [], |row| row.get(0))?;
        stats.total_connections = connections.max(0) as u64;

        Ok(stats)
    }

    fn decay_connections(
        &self,
        now: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
        rate: f64,
        min_strength: f64,
    ) -> Result<u64> {
        if rate <= 0.0 {
            return Ok(0);
        }

        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        let edges: Vec<ConnectionEdge> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM memory_connections WHERE strength > ?1",
                EDGE_COLUMNS
            ))?;
            stmt.query_map(params![min_strength], row_to_edge)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut changed = 0u64;
        for edge in &edges {
            let mut reference = edge.last_activated_at.unwrap_or(edge.created_at);
            if let Some(since) = since {
                reference = reference.max(since);
            }
            let days = crate::memory::days_between(reference, now);
            if days <= 0.0 {
                continue;
            }
            let decayed = (edge.strength * (-rate * days).exp()).max(min_strength);
            if decayed < edge.strength {
                tx.execute(
                    "UPDATE memory_connections SET strength = ?3
                     WHERE source_id = ?1 AND target_id = ?2",
                    params![edge.source_id, edge.target_id, decayed],
                )?;
                changed += 1;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    fn record_consolidation(&self, report: &ConsolidationReport) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO consolidation_runs (
                started_at, completed_at, scanned, decayed, promoted, retired,
                version_conflicts, connections_decayed, duration_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                report.started_at.to_rfc3339(),
                report.completed_at.to_rfc3339(),
                report.scanned as i64,
                report.decayed as i64,
                report.promoted as i64,
                report.retired as i64,
                report.version_conflicts as i64,
                report.connections_decayed as i64,
                report.duration_ms as i64,
            ],
        )?;
        Ok(())
    }

    fn last_consolidation_at(&self) -> Result<Option<DateTime<Utc>>> {
        let reader = self.reader()?;
        let last: Option<String> = reader.query_row(
            "SELECT MAX(completed_at) FROM consolidation_runs",
            [],
            |row| row.get(0),
        )?;
        Ok(last.map(|s| parse_timestamp(&s, "completed_at")).transpose()?)
    }

    fn ping(&self) -> Result<()> {
        let reader = self.reader()?;
        reader.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn conversion_error(kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_timestamp(value: &str, field_name: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            conversion_error(
                rusqlite::types::Type::Text,
                format!("Invalid {} timestamp '{}': {}", field_name, value, e),
            )
        })
}

fn parse_enum<T: FromStr<Err = String>>(value: &str, field_name: &str) -> rusqlite::Result<T> {
    value.parse::<T>().map_err(|e| {
        conversion_error(
            rusqlite::types::Type::Text,
            format!("Invalid {}: {}", field_name, e),
        )
    })
}

/// Little-endian f32 blob
pub(crate) fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn decode_vector(blob: &[u8]) -> rusqlite::Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(conversion_error(
            rusqlite::types::Type::Blob,
            format!("vector blob length {} is not a multiple of 4", blob.len()),
        ));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let level: String = row.get("level")?;
    let memory_type: String = row.get("memory_type")?;
    let created_at: String = row.get("created_at")?;
    let last_accessed: String = row.get("last_accessed")?;
    let last_decay_at: String = row.get("last_decay_at")?;
    let vector: Option<Vec<u8>> = row.get("vector")?;

    Ok(MemoryRecord {
        id: row.get("id")?,
        level: parse_enum(&level, "level")?,
        content: row.get("content")?,
        vector: match vector {
            Some(blob) => decode_vector(&blob)?,
            None => Vec::new(),
        },
        importance_score: row.get("importance_score")?,
        memory_type: parse_enum(&memory_type, "memory_type")?,
        decay_rate: row.get("decay_rate")?,
        created_at: parse_timestamp(&created_at, "created_at")?,
        last_accessed_at: parse_timestamp(&last_accessed, "last_accessed")?,
        access_count: row.get::<_, i64>("access_count")?.max(0) as u64,
        parent_id: row.get("parent_id")?,
        version: row.get::<_, i64>("version")?.max(0) as u64,
        last_decay_at: parse_timestamp(&last_decay_at, "last_decay_at")?,
        source_namespace: row.get("source_namespace")?,
    })
}

fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectionEdge> {
    let edge_type: String = row.get("type")?;
    let created_at: String = row.get("created_at")?;
    let last_activated: Option<String> = row.get("last_activated")?;

    Ok(ConnectionEdge {
        source_id: row.get("source_id")?,
        target_id: row.get("target_id")?,
        strength: row.get("strength")?,
        edge_type: parse_enum::<EdgeType>(&edge_type, "type")?,
        created_at: parse_timestamp(&created_at, "created_at")?,
        last_activated_at: last_activated
            .map(|s| parse_timestamp(&s, "last_activated"))
            .transpose()?,
        activation_count: row.get::<_, i64>("activation_count")?.max(0) as u64,
    })
}

// ============================================================================
// TESTS
// ============================================================================
