//! Vector index capability
//!
//! The index is partitioned per [`Level`]. Two implementations ship with the
//! crate:
//!
//! - [`FlatIndex`]: exact brute-force cosine similarity, always available
//! - [`HnswIndex`]: USearch HNSW, persisted to disk (feature `vector-search`)
//!
//! All methods take `&self`; implementations use interior locking so a single
//! index can be shared behind an `Arc` by the store and the scheduler.

mod flat;
#[cfg(feature = "vector-search")]
mod hnsw;

pub use flat::{FlatIndex, cosine_similarity};
#[cfg(feature = "vector-search")]
#[cfg_attr(docsrs, doc(cfg(feature = "vector-search")))]
pub use hnsw::{HnswConfig, HnswIndex};

use crate::memory::Level;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector index error types
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum VectorSearchError {
    /// Failed to create the index
    IndexCreation(String),
    /// Failed to add a vector
    IndexAdd(String),
    /// Failed to remove a vector
    IndexRemove(String),
    /// Failed to search
    IndexSearch(String),
    /// Failed to persist/load index
    IndexPersistence(String),
    /// Dimension mismatch
    InvalidDimensions(usize, usize),
    /// The index cannot be reached (lock poisoned, backend down)
    Unavailable(String),
}

impl std::fmt::Display for VectorSearchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorSearchError::IndexCreation(e) => write!(f, "Index creation failed: {}", e),
            VectorSearchError::IndexAdd(e) => write!(f, "Failed to add vector: {}", e),
            VectorSearchError::IndexRemove(e) => write!(f, "Failed to remove vector: {}", e),
            VectorSearchError::IndexSearch(e) => write!(f, "Search failed: {}", e),
            VectorSearchError::IndexPersistence(e) => write!(f, "Persistence failed: {}", e),
            VectorSearchError::InvalidDimensions(expected, got) => {
                write!(f, "Invalid dimensions: expected {}, got {}", expected, got)
            }
            VectorSearchError::Unavailable(e) => write!(f, "Index unavailable: {}", e),
        }
    }
}

impl std::error::Error for VectorSearchError {}

// ============================================================================
// CAPABILITY
// ============================================================================

/// Nearest-neighbor index over record vectors, partitioned by level
pub trait VectorIndex: Send + Sync {
    /// Fixed vector dimension
    fn dimensions(&self) -> usize;

    /// Insert or replace the vector stored for `id` at `level`
    fn upsert(&self, level: Level, id: &str, vector: &[f32]) -> Result<(), VectorSearchError>;

    /// Remove the entry; `Ok(false)` when it was not present
    fn delete(&self, level: Level, id: &str) -> Result<bool, VectorSearchError>;

    /// Up to `k` `(id, similarity)` pairs by descending cosine similarity,
    /// ties by ascending id
    fn query_nearest(
        &self,
        level: Level,
        probe: &[f32],
        k: usize,
    ) -> Result<Vec<(String, f32)>, VectorSearchError>;

    /// Whether an entry exists for `id` at `level`
    fn contains(&self, level: Level, id: &str) -> Result<bool, VectorSearchError>;

    /// Every id stored at `level`
    fn ids(&self, level: Level) -> Result<Vec<String>, VectorSearchError>;

    /// Total entries across all levels
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist pending state
    fn flush(&self) -> Result<(), VectorSearchError> {
        Ok(())
    }

    /// Reachability check for health reporting
    fn ping(&self) -> Result<(), VectorSearchError> {
        Ok(())
    }
}

/// Order by descending score, ties by ascending id
pub(crate) fn sort_hits(hits: &mut [(String, f32)]) {
    hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
}

pub(crate) fn check_dimensions(expected: usize, vector: &[f32]) -> Result<(), VectorSearchError> {
    if vector.len() != expected {
        return Err(VectorSearchError::InvalidDimensions(expected, vector.len()));
    }
    Ok(())
}
