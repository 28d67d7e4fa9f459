//! # Strata Core
//!
//! Hierarchical memory engine. Records live at one of three levels
//! (Concept, Context, Episode) and are stored twice: a vector entry in a
//! per-level nearest-neighbor index and a relational row with its weighted
//! edges. Retrieval seeds from the index and spreads activation over the
//! edge graph; a background scheduler ages records over time.
//!
//! - **Dual-store writes**: a record is visible only when both halves exist
//! - **Activation spreading**: bounded breadth-first propagation, deterministic
//! - **Consolidation**: exponential decay, episodic to semantic promotion,
//!   retirement of stale episodic records
//! - **Incremental ingestion**: idempotent batches with per-namespace progress
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use strata_core::{EngineConfig, IngestItem, Level, MemoryEngine};
//!
//! let engine = MemoryEngine::open_default(EngineConfig::from_env())?;
//!
//! let item = IngestItem::new("fact::sky", "The sky is blue", vector, Level::Concept);
//! engine.store().put(&item)?;
//!
//! for result in engine.query(&probe, None)? {
//!     println!("{} [{}] {:.2}", result.id, result.classification, result.score);
//! }
//! engine.close()?;
//! ```
//!
//! ## Feature Flags
//!
//! - `vector-search` (default): HNSW index with USearch
//! - `bundled-sqlite` (default): bundled SQLite
//! - `encryption`: SQLCipher, keyed by `STRATA_ENCRYPTION_KEY`

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod activation;
pub mod config;
pub mod consolidation;
pub mod error;
pub mod graph;
pub mod index;
pub mod ingest;
pub mod memory;
pub mod storage;
pub mod store;
pub mod system;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use activation::{
    Activation, ActivationEngine, AdjacencyList, Classification, NeighborSource, QueryOutcome,
    QueryResult, SpreadOutcome, spread,
};
pub use config::{
    ActivationConfig, ConnectionConfig, ConsolidationConfig, DEFAULT_DIMENSIONS,
    DEFAULT_IMPORTANCE, EngineConfig,
};
pub use consolidation::{
    ConsolidationReport, ConsolidationRules, ConsolidationScheduler, RecordPlan, SchedulerHandle,
};
pub use error::{MemoryError, Result, RetryPolicy, retry_with_backoff};
pub use graph::{BlendWeights, ConnectionGraph, Neighbors, blend};
pub use index::{FlatIndex, VectorIndex, VectorSearchError, cosine_similarity};
pub use ingest::{BatchReport, CancelToken, IngestionGateway, ItemFailure, SourceProducer};
pub use memory::{
    ConnectionEdge, EdgeType, IngestItem, IngestPayload, Level, LinkSpec, MemoryRecord,
    MemoryStats, MemoryType, NewEdge, deterministic_id,
};
pub use storage::{ProgressMark, RelationalStore, SqliteStore};
pub use store::{MemoryStore, PutResult, ReconcileReport};
pub use system::{HealthReport, MemoryEngine};

#[cfg(feature = "vector-search")]
#[cfg_attr(docsrs, doc(cfg(feature = "vector-search")))]
pub use index::{HnswConfig, HnswIndex};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
