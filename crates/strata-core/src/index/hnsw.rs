//! HNSW index backed by USearch
//!
//! One USearch index per level. String ids map to the `u64` keys USearch
//! expects; the mapping is saved next to each index file as JSON.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use super::{VectorIndex, VectorSearchError, check_dimensions, sort_hits};
use crate::memory::Level;

/// HNSW connectivity parameter (higher = better recall, more memory)
pub const DEFAULT_CONNECTIVITY: usize = 16;

/// HNSW expansion factor for index building
pub const DEFAULT_EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search (higher = better recall, slower)
pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

/// Configuration for the HNSW index
#[derive(Debug, Clone)]
pub struct HnswConfig {
    pub dimensions: usize,
    pub connectivity: usize,
    pub expansion_add: usize,
    pub expansion_search: usize,
    /// Stored scalar type; F32 keeps similarities exact enough for thresholds
    pub quantization: ScalarKind,
}

impl HnswConfig {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
            quantization: ScalarKind::F32,
        }
    }

    fn options(&self) -> IndexOptions {
        IndexOptions {
            dimensions: self.dimensions,
            metric: MetricKind::Cos,
            quantization: self.quantization,
            connectivity: self.connectivity,
            expansion_add: self.expansion_add,
            expansion_search: self.expansion_search,
            multi: false,
        }
    }
}

// ============================================================================
// PARTITION
// ============================================================================

struct Partition {
    index: Index,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
}

impl Partition {
    fn new(config: &HnswConfig) -> Result<Self, VectorSearchError> {
        let index = Index::new(&config.options())
            .map_err(|e| VectorSearchError::IndexCreation(e.to_string()))?;
        Ok(Self {
            index,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
        })
    }

    fn ensure_capacity(&self) -> Result<(), VectorSearchError> {
        // usearch requires reserve() before add()
        let capacity = self.index.capacity();
        if self.index.size() >= capacity {
            self.index
                .reserve(std::cmp::max(capacity * 2, 16))
                .map_err(|e| VectorSearchError::IndexCreation(format!("reserve failed: {}", e)))?;
        }
        Ok(())
    }

    fn upsert(&mut self, id: &str, vector: &[f32]) -> Result<(), VectorSearchError> {
        if let Some(&key) = self.key_to_id.get(id) {
            self.index
                .remove(key)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            self.ensure_capacity()?;
            return self
                .index
                .add(key, vector)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()));
        }

        self.ensure_capacity()?;
        let key = self.next_id;
        self.next_id += 1;
        self.index
            .add(key, vector)
            .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
        self.key_to_id.insert(id.to_string(), key);
        self.id_to_key.insert(key, id.to_string());
        Ok(())
    }

    fn delete(&mut self, id: &str) -> Result<bool, VectorSearchError> {
        let Some(key) = self.key_to_id.remove(id) else {
            return Ok(false);
        };
        self.id_to_key.remove(&key);
        self.index
            .remove(key)
            .map_err(|e| VectorSearchError::IndexRemove(e.to_string()))?;
        Ok(true)
    }

    fn search(&self, probe: &[f32], k: usize) -> Result<Vec<(String, f32)>, VectorSearchError> {
        if self.key_to_id.is_empty() || k == 0 {
            return Ok(vec![]);
        }
        let matches = self
            .index
            .search(probe, k)
            .map_err(|e| VectorSearchError::IndexSearch(e.to_string()))?;

        let mut hits = Vec::with_capacity(matches.keys.len());
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            if let Some(id) = self.id_to_key.get(key) {
                // cosine distance -> similarity
                hits.push((id.clone(), 1.0 - distance));
            }
        }
        Ok(hits)
    }

    fn save(&self, path: &Path) -> Result<(), VectorSearchError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| VectorSearchError::IndexPersistence("Invalid path".to_string()))?;
        self.index
            .save(path_str)
            .map_err(|e| VectorSearchError::IndexPersistence(e.to_string()))?;

        let mappings = serde_json::json!({
            "key_to_id": self.key_to_id,
            "next_id": self.next_id,
        });
        let mappings_str = serde_json::to_string(&mappings)
            .map_err(|e| VectorSearchError::IndexPersistence(e.to_string()))?;
        std::fs::write(path.with_extension("mappings.json"), mappings_str)
            .map_err(|e| VectorSearchError::IndexPersistence(e.to_string()))?;
        Ok(())
    }

    fn load(path: &Path, config: &HnswConfig) -> Result<Self, VectorSearchError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| VectorSearchError::IndexPersistence("Invalid path".to_string()))?;
        let partition = Self::new(config)?;
        partition
            .index
            .load(path_str)
            .map_err(|e| VectorSearchError::IndexPersistence(e.to_string()))?;

        let mappings_str = std::fs::read_to_string(path.with_extension("mappings.json"))
            .map_err(|e| VectorSearchError::IndexPersistence(e.to_string()))?;
        let mappings: serde_json::Value = serde_json::from_str(&mappings_str)
            .map_err(|e| VectorSearchError::IndexPersistence(e.to_string()))?;
        let key_to_id: HashMap<String, u64> =
            serde_json::from_value(mappings["key_to_id"].clone())
                .map_err(|e| VectorSearchError::IndexPersistence(e.to_string()))?;
        let next_id = mappings["next_id"]
            .as_u64()
            .ok_or_else(|| VectorSearchError::IndexPersistence("Invalid next_id".to_string()))?;
        let id_to_key = key_to_id.iter().map(|(k, &v)| (v, k.clone())).collect();

        Ok(Self {
            key_to_id,
            id_to_key,
            next_id,
            ..partition
        })
    }
}

// ============================================================================
// HNSW INDEX
// ============================================================================

/// Approximate nearest-neighbor index, one HNSW graph per level
pub struct HnswIndex {
    config: HnswConfig,
    dir: Option<PathBuf>,
    partitions: Mutex<HashMap<Level, Partition>>,
}

impl HnswIndex {
    /// Purely in-memory index
    pub fn in_memory(config: HnswConfig) -> Result<Self, VectorSearchError> {
        let mut partitions = HashMap::new();
        for level in Level::ALL {
            partitions.insert(level, Partition::new(&config)?);
        }
        Ok(Self {
            config,
            dir: None,
            partitions: Mutex::new(partitions),
        })
    }

    /// Open the index persisted under `dir`, starting empty for levels with no
    /// readable file. Missing entries are restored by store reconciliation.
    pub fn open(dir: impl Into<PathBuf>, config: HnswConfig) -> Result<Self, VectorSearchError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| VectorSearchError::IndexPersistence(e.to_string()))?;

        let mut partitions = HashMap::new();
        for level in Level::ALL {
            let path = Self::level_path(&dir, level);
            let partition = if path.exists() {
                match Partition::load(&path, &config) {
                    Ok(p) => {
                        tracing::info!(%level, vectors = p.key_to_id.len(), "Loaded HNSW partition");
                        p
                    }
                    Err(e) => {
                        tracing::warn!(%level, "Failed to load HNSW partition, rebuilding: {}", e);
                        Partition::new(&config)?
                    }
                }
            } else {
                Partition::new(&config)?
            };
            partitions.insert(level, partition);
        }

        Ok(Self {
            config,
            dir: Some(dir),
            partitions: Mutex::new(partitions),
        })
    }

    fn level_path(dir: &Path, level: Level) -> PathBuf {
        dir.join(format!("{}.usearch", level.as_str()))
    }

    fn with_partition<T>(
        &self,
        level: Level,
        f: impl FnOnce(&mut Partition) -> Result<T, VectorSearchError>,
    ) -> Result<T, VectorSearchError> {
        let mut partitions = self
            .partitions
            .lock()
            .map_err(|_| VectorSearchError::Unavailable("HNSW lock poisoned".to_string()))?;
        match partitions.get_mut(&level) {
            Some(partition) => f(partition),
            None => Err(VectorSearchError::Unavailable(format!(
                "no partition for level {}",
                level
            ))),
        }
    }
}

impl VectorIndex for HnswIndex {
    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn upsert(&self, level: Level, id: &str, vector: &[f32]) -> Result<(), VectorSearchError> {
        check_dimensions(self.config.dimensions, vector)?;
        self.with_partition(level, |p| p.upsert(id, vector))
    }

    fn delete(&self, level: Level, id: &str) -> Result<bool, VectorSearchError> {
        self.with_partition(level, |p| p.delete(id))
    }

    fn query_nearest(
        &self,
        level: Level,
        probe: &[f32],
        k: usize,
    ) -> Result<Vec<(String, f32)>, VectorSearchError> {
        check_dimensions(self.config.dimensions, probe)?;
        let mut hits = self.with_partition(level, |p| p.search(probe, k))?;
        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    fn contains(&self, level: Level, id: &str) -> Result<bool, VectorSearchError> {
        self.with_partition(level, |p| Ok(p.key_to_id.contains_key(id)))
    }

    fn ids(&self, level: Level) -> Result<Vec<String>, VectorSearchError> {
        self.with_partition(level, |p| {
            let mut ids: Vec<String> = p.key_to_id.keys().cloned().collect();
            ids.sort();
            Ok(ids)
        })
    }

    fn len(&self) -> usize {
        self.partitions
            .lock()
            .map(|p| p.values().map(|part| part.key_to_id.len()).sum())
            .unwrap_or(0)
    }

    fn flush(&self) -> Result<(), VectorSearchError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let partitions = self
            .partitions
            .lock()
            .map_err(|_| VectorSearchError::Unavailable("HNSW lock poisoned".to_string()))?;
        for (level, partition) in partitions.iter() {
            partition.save(&Self::level_path(dir, *level))?;
        }
        tracing::debug!(dir = %dir.display(), "Flushed HNSW partitions");
        Ok(())
    }

    fn ping(&self) -> Result<(), VectorSearchError> {
        self.partitions
            .lock()
            .map(|_| ())
            .map_err(|_| VectorSearchError::Unavailable("HNSW lock poisoned".to_string()))
    }
}
