//! Connection graph
//!
//! Weighted, typed adjacency over memory ids, persisted in the relational
//! store. Edges are stored directed (at most one per ordered pair) but
//! traversed in both directions.
//!
//! Node removal is not exposed here: edges of a removed record are deleted in
//! the same transaction as the record itself by [`crate::MemoryStore::remove`].

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::ConnectionConfig;
use crate::error::{MemoryError, Result};
use crate::memory::{ConnectionEdge, EdgeType, NewEdge, validate_id};
use crate::storage::{NeighborCursor, RelationalStore};

/// Neighbors fetched per round trip
const NEIGHBOR_PAGE_SIZE: usize = 64;

// ============================================================================
// BLENDING
// ============================================================================

/// Weights applied when an existing edge is reinforced
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlendWeights {
    pub existing: f64,
    pub contribution: f64,
}

impl Default for BlendWeights {
    fn default() -> Self {
        Self {
            existing: 0.7,
            contribution: 0.3,
        }
    }
}

impl From<&ConnectionConfig> for BlendWeights {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            existing: config.existing_weight,
            contribution: config.contribution_weight,
        }
    }
}

/// `existing * w_existing + contribution * w_contribution`, clamped to [0, 1]
pub fn blend(existing: f64, contribution: f64, weights: BlendWeights) -> f64 {
    (existing * weights.existing + contribution * weights.contribution).clamp(0.0, 1.0)
}

// ============================================================================
// GRAPH
// ============================================================================

/// Handle over the persisted edge relation
#[derive(Clone)]
pub struct ConnectionGraph {
    relational: Arc<dyn RelationalStore>,
    weights: BlendWeights,
}

impl ConnectionGraph {
    pub fn new(relational: Arc<dyn RelationalStore>, weights: BlendWeights) -> Self {
        Self {
            relational,
            weights,
        }
    }

    pub fn weights(&self) -> BlendWeights {
        self.weights
    }

    /// Create the edge with `strength = contribution`, or blend the
    /// contribution into the existing strength. Activation counters are left
    /// untouched.
    pub fn upsert_edge(
        &self,
        source_id: &str,
        target_id: &str,
        contribution: f64,
        edge_type: EdgeType,
    ) -> Result<ConnectionEdge> {
        validate_id(source_id)?;
        validate_id(target_id)?;
        let edge = NewEdge {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            strength: contribution,
            edge_type,
        };
        edge.validate()?;

        for id in [source_id, target_id] {
            if !self.relational.memory_exists(id)? {
                return Err(MemoryError::NotFound(id.to_string()));
            }
        }

        let stored = self.relational.upsert_edge(&edge, self.weights, Utc::now())?;
        tracing::debug!(
            source = source_id,
            target = target_id,
            strength = stored.strength,
            "Upserted edge"
        );
        Ok(stored)
    }

    /// Stored edge for the ordered pair, if any
    pub fn edge(&self, source_id: &str, target_id: &str) -> Result<Option<ConnectionEdge>> {
        self.relational.get_edge(source_id, target_id)
    }

    /// Every stored edge touching `id`
    pub fn edges(&self, id: &str) -> Result<Vec<ConnectionEdge>> {
        self.relational.edges_for(id)
    }

    /// Lazy sequence of `(neighbor, strength)` over both stored directions
    pub fn neighbors(&self, id: &str) -> Neighbors {
        Neighbors {
            relational: Arc::clone(&self.relational),
            id: id.to_string(),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }
}

// ============================================================================
// NEIGHBORS
// ============================================================================

/// Finite, restartable neighbor sequence ordered by strength descending then
/// id ascending. Pages are fetched on demand with a keyset cursor, so a
/// consumer that stops early never reads the tail.
pub struct Neighbors {
    relational: Arc<dyn RelationalStore>,
    id: String,
    cursor: Option<NeighborCursor>,
    buffer: VecDeque<(String, f64)>,
    exhausted: bool,
}

impl Neighbors {
    /// Rewind to the first neighbor
    pub fn restart(&mut self) {
        self.cursor = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fill(&mut self) -> Result<()> {
        let page =
            self.relational
                .neighbors_page(&self.id, self.cursor.as_ref(), NEIGHBOR_PAGE_SIZE)?;
        if page.len() < NEIGHBOR_PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some((id, strength)) = page.last() {
            self.cursor = Some(NeighborCursor {
                strength: *strength,
                id: id.clone(),
            });
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for Neighbors {
    type Item = Result<(String, f64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
