//! Memory records, edges and ingest items

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{EdgeType, Level, MemoryType};
use crate::error::{MemoryError, Result};

/// Longest accepted id
pub const MAX_ID_LEN: usize = 256;

// ============================================================================
// MEMORY RECORD
// ============================================================================

/// A content-addressed unit of memory
///
/// `content` and `vector` never change after the record is written. The
/// mutable fields (`importance_score`, `memory_type`, `decay_rate`,
/// `access_count`, `last_accessed_at`) are guarded by `version`, which
/// increments on every persisted mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: String,
    pub level: Level,
    pub content: String,
    pub vector: Vec<f32>,
    pub importance_score: f64,
    pub memory_type: MemoryType,
    /// Decay rate per day
    pub decay_rate: f64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub parent_id: Option<String>,
    /// Optimistic concurrency token
    pub version: u64,
    /// Last time consolidation applied decay to this record
    pub last_decay_at: DateTime<Utc>,
    /// Producer namespace that ingested the record, if any
    pub source_namespace: Option<String>,
}

impl MemoryRecord {
    /// Build a fresh episodic record from an ingest item
    pub fn from_item(
        item: &IngestItem,
        now: DateTime<Utc>,
        default_importance: f64,
        episodic_decay_rate: f64,
    ) -> Self {
        Self {
            id: item.id.clone(),
            level: item.level,
            content: item.content.clone(),
            vector: item.vector.clone(),
            importance_score: item.payload.importance.unwrap_or(default_importance),
            memory_type: MemoryType::Episodic,
            decay_rate: episodic_decay_rate,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            parent_id: item.payload.parent_id.clone(),
            version: 1,
            last_decay_at: now,
            source_namespace: None,
        }
    }

    /// Reference into the partitioned vector index
    pub fn vector_ref(&self) -> String {
        format!("{}/{}", self.level, self.id)
    }

    /// Fractional days since `created_at`
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        days_between(self.created_at, now)
    }
}

/// Fractional days from `from` to `to`, clamped at zero
pub(crate) fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let seconds = (to - from).num_milliseconds() as f64 / 1000.0;
    (seconds / 86_400.0).max(0.0)
}

// ============================================================================
// CONNECTION EDGE
// ============================================================================

/// Stored associative relationship between two memories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEdge {
    pub source_id: String,
    pub target_id: String,
    /// Strength in [0, 1]
    pub strength: f64,
    pub edge_type: EdgeType,
    pub created_at: DateTime<Utc>,
    pub last_activated_at: Option<DateTime<Utc>>,
    pub activation_count: u64,
}

/// An edge to be written alongside a record
#[derive(Debug, Clone, PartialEq)]
pub struct NewEdge {
    pub source_id: String,
    pub target_id: String,
    pub strength: f64,
    pub edge_type: EdgeType,
}

impl NewEdge {
    pub fn validate(&self) -> Result<()> {
        if self.source_id == self.target_id {
            return Err(MemoryError::Validation(format!(
                "self-loop edge on {}",
                self.source_id
            )));
        }
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(MemoryError::Validation(format!(
                "edge strength {} outside [0, 1]",
                self.strength
            )));
        }
        Ok(())
    }
}

// ============================================================================
// INGEST INPUT
// ============================================================================

/// Outgoing link declared by an ingest item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LinkSpec {
    pub target_id: String,
    pub strength: f64,
    #[serde(default)]
    pub edge_type: EdgeType,
}

/// Typed metadata carried by an ingest item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IngestPayload {
    /// Hierarchical parent; must already exist
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Initial importance; engine default when absent
    #[serde(default)]
    pub importance: Option<f64>,
    /// Edges from this item to existing records
    #[serde(default)]
    pub links: Vec<LinkSpec>,
    /// Producer-side timestamp recorded as the namespace high-water mark
    #[serde(default)]
    pub source_timestamp: Option<DateTime<Utc>>,
}

/// One item submitted to the ingestion gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IngestItem {
    pub id: String,
    pub content: String,
    pub vector: Vec<f32>,
    pub level: Level,
    #[serde(default)]
    pub payload: IngestPayload,
}

impl IngestItem {
    /// Item with an empty payload
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        vector: Vec<f32>,
        level: Level,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            vector,
            level,
            payload: IngestPayload::default(),
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.payload.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.payload.importance = Some(importance);
        self
    }

    pub fn with_link(mut self, target_id: impl Into<String>, strength: f64, edge_type: EdgeType) -> Self {
        self.payload.links.push(LinkSpec {
            target_id: target_id.into(),
            strength,
            edge_type,
        });
        self
    }

    /// Checks that need no store access
    pub fn validate(&self, dimensions: usize) -> Result<()> {
        validate_id(&self.id)?;
        validate_vector(&self.vector, dimensions)?;
        if let Some(importance) = self.payload.importance {
            if !(0.0..=1.0).contains(&importance) {
                return Err(MemoryError::Validation(format!(
                    "importance {} outside [0, 1]",
                    importance
                )));
            }
        }
        if let Some(parent) = &self.payload.parent_id {
            validate_id(parent)?;
            if parent == &self.id {
                return Err(MemoryError::Validation(format!(
                    "{} cannot be its own parent",
                    self.id
                )));
            }
        }
        let mut targets = std::collections::HashSet::new();
        for link in &self.payload.links {
            validate_id(&link.target_id)?;
            self.link_edge(link).validate()?;
            if !targets.insert(link.target_id.as_str()) {
                return Err(MemoryError::Validation(format!(
                    "duplicate link from {} to {}",
                    self.id, link.target_id
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn link_edge(&self, link: &LinkSpec) -> NewEdge {
        NewEdge {
            source_id: self.id.clone(),
            target_id: link.target_id.clone(),
            strength: link.strength,
            edge_type: link.edge_type,
        }
    }
}

/// Ids are non-empty, bounded, and free of whitespace and control characters
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(MemoryError::Validation("id must not be empty".into()));
    }
    if id.len() > MAX_ID_LEN {
        return Err(MemoryError::Validation(format!(
            "id longer than {} bytes",
            MAX_ID_LEN
        )));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(MemoryError::Validation(format!(
            "id {:?} contains whitespace or control characters",
            id
        )));
    }
    Ok(())
}

/// Vectors have exactly `dimensions` finite components and a non-zero norm
pub fn validate_vector(vector: &[f32], dimensions: usize) -> Result<()> {
    if vector.len() != dimensions {
        return Err(MemoryError::Validation(format!(
            "vector has {} dimensions, expected {}",
            vector.len(),
            dimensions
        )));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(MemoryError::Validation(
            "vector contains non-finite values".into(),
        ));
    }
    if vector.iter().all(|v| *v == 0.0) {
        return Err(MemoryError::Validation("vector has zero norm".into()));
    }
    Ok(())
}

/// `"{kind}::"` followed by the first 32 hex chars of SHA-256(content)
pub fn deterministic_id(kind: &str, content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let hex = hex::encode(digest);
    format!("{}::{}", kind, &hex[..32])
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Aggregate counts over the relational store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total_memories: u64,
    pub memories_by_level: BTreeMap<Level, u64>,
    pub memories_by_type: BTreeMap<String, u64>,
    pub total_connections: u64,
    pub average_importance: f64,
    pub oldest_memory: Option<DateTime<Utc>>,
    pub newest_memory: Option<DateTime<Utc>>,
}
