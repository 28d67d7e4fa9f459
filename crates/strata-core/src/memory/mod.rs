//! Memory module - Core types and data structures
//!
//! - Hierarchy levels partitioning the vector index
//! - Episodic/semantic memory tiers
//! - Typed, weighted associative edges
//! - Records, ingest items and their validation

mod record;

pub use record::{
    ConnectionEdge, IngestItem, IngestPayload, LinkSpec, MemoryRecord, MemoryStats, NewEdge,
    deterministic_id, validate_id, validate_vector,
};
pub(crate) use record::days_between;

use serde::{Deserialize, Serialize};

// ============================================================================
// HIERARCHY LEVELS
// ============================================================================

/// Coarse-to-fine hierarchy tier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Abstract, cross-cutting knowledge (tier 0)
    Concept,
    /// Situational grouping of episodes (tier 1)
    Context,
    /// A specific event or observation (tier 2)
    Episode,
}

impl Level {
    /// All levels, coarse to fine
    pub const ALL: [Level; 3] = [Level::Concept, Level::Context, Level::Episode];

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Concept => "concept",
            Level::Context => "context",
            Level::Episode => "episode",
        }
    }

    /// Numeric tier (0 = coarsest)
    pub fn tier(&self) -> u8 {
        match self {
            Level::Concept => 0,
            Level::Context => 1,
            Level::Episode => 2,
        }
    }

    /// Level for a numeric tier
    pub fn from_tier(tier: u8) -> Option<Self> {
        match tier {
            0 => Some(Level::Concept),
            1 => Some(Level::Context),
            2 => Some(Level::Episode),
            _ => None,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "concept" | "0" => Ok(Level::Concept),
            "context" | "1" => Ok(Level::Context),
            "episode" | "2" => Ok(Level::Episode),
            _ => Err(format!("Unknown level: {}", s)),
        }
    }
}

// ============================================================================
// MEMORY TYPES
// ============================================================================

/// Memory tier: episodic decays fast and may be retired, semantic is retained
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    /// Newly written memories
    #[default]
    Episodic,
    /// Consolidated through repeated access; never demoted
    Semantic,
}

impl MemoryType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Episodic => "episodic",
            MemoryType::Semantic => "semantic",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "episodic" => Ok(MemoryType::Episodic),
            "semantic" => Ok(MemoryType::Semantic),
            _ => Err(format!("Unknown memory type: {}", s)),
        }
    }
}

// ============================================================================
// EDGE TYPES
// ============================================================================

/// Type of relationship between two memories
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    /// Generic co-occurrence association
    #[default]
    Associative,
    /// Similar meaning or topic
    Semantic,
    /// A caused or explains B
    Causal,
    /// A happened before B
    Temporal,
    /// Parent to child in the level hierarchy
    Hierarchical,
}

impl EdgeType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Associative => "associative",
            EdgeType::Semantic => "semantic",
            EdgeType::Causal => "causal",
            EdgeType::Temporal => "temporal",
            EdgeType::Hierarchical => "hierarchical",
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EdgeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "associative" => Ok(EdgeType::Associative),
            "semantic" => Ok(EdgeType::Semantic),
            "causal" => Ok(EdgeType::Causal),
            "temporal" => Ok(EdgeType::Temporal),
            "hierarchical" => Ok(EdgeType::Hierarchical),
            _ => Err(format!("Unknown edge type: {}", s)),
        }
    }
}
