//! Activation spreading
//!
//! Query-time retrieval in two phases:
//!
//! 1. **Seeding**: nearest neighbors of the probe at the seed level; each
//!    seed's activation is its similarity. Seeds are always returned.
//! 2. **Spreading**: breadth-first over the connection graph with an explicit
//!    queue. A neighbor reached from `n` gets `a_n * strength` and is visited
//!    only if that clears the activation threshold and the visit budget
//!    (`max_activations`) is not exhausted. The first activation a node
//!    receives is final.
//!
//! Nodes that are seeds or whose activation reaches the core threshold are
//! **core**; the rest are **peripheral**. Results are ordered by activation
//! descending, ties by id ascending.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ActivationConfig;
use crate::error::{MemoryError, Result};
use crate::graph::ConnectionGraph;
use crate::store::MemoryStore;

// ============================================================================
// TYPES
// ============================================================================

/// Result tier of a visited node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Core,
    Peripheral,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Core => "core",
            Classification::Peripheral => "peripheral",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "core" => Ok(Classification::Core),
            "peripheral" => Ok(Classification::Peripheral),
            _ => Err(format!("Unknown classification: {}", s)),
        }
    }
}

/// One visited node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activation {
    pub id: String,
    pub activation: f64,
    pub classification: Classification,
    pub is_seed: bool,
    /// Hops from the nearest seed
    pub depth: u32,
}

/// Output of [`spread`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpreadOutcome {
    /// Visited nodes in result order
    pub activations: Vec<Activation>,
    /// Edges `(from, to)` that activated a node
    pub used_edges: Vec<(String, String)>,
}

/// A returned memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub id: String,
    pub content: String,
    pub score: f64,
    pub classification: Classification,
}

/// Results of a query plus whether its access was recorded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutcome {
    pub results: Vec<QueryResult>,
    /// False when the store could not record access on the returned records;
    /// their `access_count` did not move and promotion will not see this query
    pub touched: bool,
}

// ============================================================================
// NEIGHBOR SOURCES
// ============================================================================

/// Adjacency consumed by [`spread`]
///
/// Implementations yield neighbors over both edge directions ordered by
/// strength descending, then id ascending. The spreading loop stops reading a
/// node's neighbors at the first one that cannot clear the threshold.
pub trait NeighborSource {
    fn neighbors<'a>(&'a self, id: &str) -> Box<dyn Iterator<Item = Result<(String, f64)>> + 'a>;
}

impl NeighborSource for ConnectionGraph {
    fn neighbors<'a>(&'a self, id: &str) -> Box<dyn Iterator<Item = Result<(String, f64)>> + 'a> {
        Box::new(ConnectionGraph::neighbors(self, id))
    }
}

/// In-memory undirected adjacency
#[derive(Debug, Clone, Default)]
pub struct AdjacencyList {
    edges: HashMap<String, Vec<(String, f64)>>,
}

impl AdjacencyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an undirected edge; the stronger strength wins on repeats
    pub fn add_edge(&mut self, a: &str, b: &str, strength: f64) {
        if a == b {
            return;
        }
        Self::insert_half(&mut self.edges, a, b, strength);
        Self::insert_half(&mut self.edges, b, a, strength);
    }

    fn insert_half(
        edges: &mut HashMap<String, Vec<(String, f64)>>,
        from: &str,
        to: &str,
        strength: f64,
    ) {
        let list = edges.entry(from.to_string()).or_default();
        match list.iter_mut().find(|(id, _)| id == to) {
            Some(entry) => entry.1 = entry.1.max(strength),
            None => list.push((to.to_string(), strength)),
        }
        list.sort_by(|x, y| y.1.total_cmp(&x.1).then_with(|| x.0.cmp(&y.0)));
    }
}

impl NeighborSource for AdjacencyList {
    fn neighbors<'a>(&'a self, id: &str) -> Box<dyn Iterator<Item = Result<(String, f64)>> + 'a> {
        match self.edges.get(id) {
            Some(list) => Box::new(list.iter().cloned().map(Ok)),
            None => Box::new(std::iter::empty()),
        }
    }
}

// ============================================================================
// SPREADING
// ============================================================================

/// Bounded breadth-first activation spreading
///
/// Never fails: a neighbor lookup error is logged and treated as "no further
/// neighbors" for that node.
pub fn spread(
    seeds: &[(String, f64)],
    source: &dyn NeighborSource,
    config: &ActivationConfig,
) -> SpreadOutcome {
    let budget = config.max_activations;

    let mut ordered_seeds: Vec<&(String, f64)> = seeds.iter().collect();
    ordered_seeds.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut nodes: Vec<Activation> = Vec::new();
    let mut visited: HashMap<String, usize> = HashMap::new();
    let mut queue: VecDeque<usize> = VecDeque::new();
    let mut used_edges = Vec::new();

    for (id, score) in ordered_seeds {
        if visited.len() >= budget {
            break;
        }
        if visited.contains_key(id) {
            continue;
        }
        visited.insert(id.clone(), nodes.len());
        queue.push_back(nodes.len());
        nodes.push(Activation {
            id: id.clone(),
            activation: *score,
            classification: Classification::Core,
            is_seed: true,
            depth: 0,
        });
    }

    'spread: while let Some(current) = queue.pop_front() {
        let (from, a_n, depth) = {
            let node = &nodes[current];
            (node.id.clone(), node.activation, node.depth)
        };

        for neighbor in source.neighbors(&from) {
            let (m, strength) = match neighbor {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(id = %from, "Neighbor lookup failed, skipping: {}", e);
                    break;
                }
            };

            let a_m = a_n * strength;
            if a_m < config.activation_threshold {
                // Neighbors arrive strongest first
                break;
            }
            if visited.contains_key(&m) {
                continue;
            }
            if visited.len() >= budget {
                break 'spread;
            }

            visited.insert(m.clone(), nodes.len());
            queue.push_back(nodes.len());
            used_edges.push((from.clone(), m.clone()));
            nodes.push(Activation {
                id: m,
                activation: a_m,
                classification: if a_m >= config.core_threshold {
                    Classification::Core
                } else {
                    Classification::Peripheral
                },
                is_seed: false,
                depth: depth + 1,
            });
        }
    }

    nodes.sort_by(|a, b| {
        b.activation
            .total_cmp(&a.activation)
            .then_with(|| a.id.cmp(&b.id))
    });

    SpreadOutcome {
        activations: nodes,
        used_edges,
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Runs queries against a [`MemoryStore`]
#[derive(Clone)]
pub struct ActivationEngine {
    store: Arc<MemoryStore>,
    defaults: ActivationConfig,
}

impl ActivationEngine {
    pub fn new(store: Arc<MemoryStore>, defaults: ActivationConfig) -> Self {
        Self { store, defaults }
    }

    pub fn defaults(&self) -> &ActivationConfig {
        &self.defaults
    }

    /// Query with the engine's default parameters
    pub fn query(&self, probe: &[f32]) -> Result<Vec<QueryResult>> {
        let params = self.defaults.clone();
        self.query_with(probe, &params)
    }

    /// Seed, spread, resolve records, then record the access on every
    /// returned record and used edge
    pub fn query_with(&self, probe: &[f32], params: &ActivationConfig) -> Result<Vec<QueryResult>> {
        self.query_outcome(probe, params).map(|outcome| outcome.results)
    }

    /// Like [`query_with`](Self::query_with), reporting whether the access
    /// side effect was recorded
    pub fn query_outcome(&self, probe: &[f32], params: &ActivationConfig) -> Result<QueryOutcome> {
        validate_params(params)?;
        let started = std::time::Instant::now();

        let seeds: Vec<(String, f64)> = self
            .store
            .query_nearest(params.seed_level, probe, params.seed_k)?
            .into_iter()
            .map(|(id, score)| (id, f64::from(score)))
            .collect();

        let graph = self.store.graph();
        let outcome = spread(&seeds, &graph, params);

        let mut results = Vec::with_capacity(outcome.activations.len());
        for node in &outcome.activations {
            match self.store.get(&node.id) {
                Ok(record) => results.push(QueryResult {
                    id: node.id.clone(),
                    content: record.content,
                    score: node.activation,
                    classification: node.classification,
                }),
                // Removed since the traversal read it
                Err(MemoryError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        let returned: Vec<String> = results.iter().map(|r| r.id.clone()).collect();
        let edges: Vec<(String, String)> = outcome
            .used_edges
            .into_iter()
            .filter(|(a, b)| returned.contains(a) && returned.contains(b))
            .collect();
        let touched = match self.store.touch(&returned, &edges) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(records = returned.len(), "Failed to record access: {}", e);
                false
            }
        };

        tracing::debug!(
            seeds = seeds.len(),
            results = results.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Activation query complete"
        );
        Ok(QueryOutcome { results, touched })
    }
}

fn validate_params(params: &ActivationConfig) -> Result<()> {
    for (name, value) in [
        ("activation_threshold", params.activation_threshold),
        ("core_threshold", params.core_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(MemoryError::Validation(format!(
                "{} must be within [0, 1] (got {})",
                name, value
            )));
        }
    }
    if params.max_activations == 0 {
        return Err(MemoryError::Validation("max_activations must be > 0".into()));
    }
    Ok(())
}
