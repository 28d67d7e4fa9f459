//! Exact brute-force index

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{VectorIndex, VectorSearchError, check_dimensions, sort_hits};
use crate::memory::Level;

/// Cosine similarity between two vectors; 0.0 for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// In-memory exact cosine index
///
/// Scans every vector of the requested level. Suited to tests and small
/// deployments; rebuilt from the relational store on open.
pub struct FlatIndex {
    dimensions: usize,
    partitions: RwLock<HashMap<Level, BTreeMap<String, Vec<f32>>>>,
}

impl FlatIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            partitions: RwLock::new(HashMap::new()),
        }
    }
}

fn poisoned() -> VectorSearchError {
    VectorSearchError::Unavailable("flat index lock poisoned".to_string())
}

impl VectorIndex for FlatIndex {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn upsert(&self, level: Level, id: &str, vector: &[f32]) -> Result<(), VectorSearchError> {
        check_dimensions(self.dimensions, vector)?;
        let mut partitions = self.partitions.write().map_err(|_| poisoned())?;
        partitions
            .entry(level)
            .or_default()
            .insert(id.to_string(), vector.to_vec());
        Ok(())
    }

    fn delete(&self, level: Level, id: &str) -> Result<bool, VectorSearchError> {
        let mut partitions = self.partitions.write().map_err(|_| poisoned())?;
        Ok(partitions
            .get_mut(&level)
            .map(|p| p.remove(id).is_some())
            .unwrap_or(false))
    }

    fn query_nearest(
        &self,
        level: Level,
        probe: &[f32],
        k: usize,
    ) -> Result<Vec<(String, f32)>, VectorSearchError> {
        check_dimensions(self.dimensions, probe)?;
        let partitions = self.partitions.read().map_err(|_| poisoned())?;
        let Some(partition) = partitions.get(&level) else {
            return Ok(vec![]);
        };

        let mut hits: Vec<(String, f32)> = partition
            .iter()
            .map(|(id, v)| (id.clone(), cosine_similarity(probe, v)))
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    fn contains(&self, level: Level, id: &str) -> Result<bool, VectorSearchError> {
        let partitions = self.partitions.read().map_err(|_| poisoned())?;
        Ok(partitions
            .get(&level)
            .map(|p| p.contains_key(id))
            .unwrap_or(false))
    }

    fn ids(&self, level: Level) -> Result<Vec<String>, VectorSearchError> {
        let partitions = self.partitions.read().map_err(|_| poisoned())?;
        Ok(partitions
            .get(&level)
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn len(&self) -> usize {
        self.partitions
            .read()
            .map(|p| p.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }
}
