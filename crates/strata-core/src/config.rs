//! Engine configuration
//!
//! Every tunable lives here with its default. Thresholds and blend weights are
//! illustrative defaults, not derived constants; deployments override them via
//! `STRATA_*` environment variables or by building the struct directly.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result, RetryPolicy};
use crate::memory::Level;

/// Default embedding dimension
pub const DEFAULT_DIMENSIONS: usize = 256;

/// Importance assigned to records ingested without an explicit score
pub const DEFAULT_IMPORTANCE: f64 = 0.5;

// ============================================================================
// ACTIVATION
// ============================================================================

/// Parameters for activation spreading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationConfig {
    /// Minimum propagated activation for a neighbor to be visited
    pub activation_threshold: f64,
    /// Hard cap on visited nodes per query
    pub max_activations: usize,
    /// Activation at or above which a node is classified core
    pub core_threshold: f64,
    /// Nearest neighbors taken as seeds
    pub seed_k: usize,
    /// Index partition the seeds are drawn from
    pub seed_level: Level,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            activation_threshold: 0.7,
            max_activations: 50,
            core_threshold: 0.85,
            seed_k: 10,
            seed_level: Level::Concept,
        }
    }
}

// ============================================================================
// CONNECTIONS
// ============================================================================

/// Edge strength blending
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Weight of the stored strength when an edge is reinforced
    pub existing_weight: f64,
    /// Weight of the new contribution when an edge is reinforced
    pub contribution_weight: f64,
    /// Strength of the parent -> child edge created for hierarchical records
    pub parent_edge_strength: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            existing_weight: 0.7,
            contribution_weight: 0.3,
            parent_edge_strength: 0.8,
        }
    }
}

// ============================================================================
// CONSOLIDATION
// ============================================================================

/// Decay, promotion and retirement rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationConfig {
    /// Access count at which an episodic record becomes semantic
    pub consolidation_threshold: u64,
    /// Decay rate per day for episodic records
    pub episodic_decay_rate: f64,
    /// Decay rate per day for semantic records
    pub semantic_decay_rate: f64,
    /// Importance below which an untouched episodic record may be retired
    pub retirement_floor: f64,
    /// Minimum age in days before retirement
    pub retirement_ttl_days: i64,
    /// Whether the retirement rule runs at all
    pub enable_retirement: bool,
    /// Decay rate per day for edge strength (0 disables)
    pub connection_decay_rate: f64,
    /// Edge strength never decays below this
    pub min_connection_strength: f64,
    /// Re-read attempts after a version conflict on a single record
    pub max_version_retries: u32,
    /// Period of the background loop
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            consolidation_threshold: 100,
            episodic_decay_rate: 0.1,
            semantic_decay_rate: 0.01,
            retirement_floor: 0.1,
            retirement_ttl_days: 30,
            enable_retirement: true,
            connection_decay_rate: 0.0,
            min_connection_strength: 0.1,
            max_version_retries: 3,
            interval: Duration::from_secs(6 * 60 * 60),
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Top-level configuration for [`crate::MemoryEngine`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Fixed vector dimension D
    pub dimensions: usize,
    /// Directory holding the database and index files; platform default when unset
    pub data_dir: Option<PathBuf>,
    /// Importance for records ingested without one
    pub default_importance: f64,
    pub activation: ActivationConfig,
    pub connections: ConnectionConfig,
    pub consolidation: ConsolidationConfig,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
            data_dir: None,
            default_importance: DEFAULT_IMPORTANCE,
            activation: ActivationConfig::default(),
            connections: ConnectionConfig::default(),
            consolidation: ConsolidationConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `STRATA_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("STRATA_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = Some(PathBuf::from(dir));
            }
        }
        overlay(&mut config.dimensions, "STRATA_DIMENSIONS");
        overlay(
            &mut config.activation.activation_threshold,
            "STRATA_ACTIVATION_THRESHOLD",
        );
        overlay(&mut config.activation.max_activations, "STRATA_MAX_ACTIVATIONS");
        overlay(&mut config.activation.core_threshold, "STRATA_CORE_THRESHOLD");
        overlay(
            &mut config.consolidation.consolidation_threshold,
            "STRATA_CONSOLIDATION_THRESHOLD",
        );

        let mut hours: Option<u64> = None;
        overlay_opt(&mut hours, "STRATA_CONSOLIDATION_INTERVAL_HOURS");
        if let Some(h) = hours {
            config.consolidation.interval = Duration::from_secs(h.max(1) * 3600);
        }

        config
    }

    /// Resolve the data directory, creating it if needed
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        let dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => {
                let proj_dirs = ProjectDirs::from("com", "strata", "core").ok_or_else(|| {
                    MemoryError::Init("Could not determine project directories".to_string())
                })?;
                proj_dirs.data_dir().to_path_buf()
            }
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.dimensions == 0 {
            return Err(MemoryError::Validation("dimensions must be > 0".into()));
        }
        check_unit("default_importance", self.default_importance)?;

        let a = &self.activation;
        check_unit("activation_threshold", a.activation_threshold)?;
        check_unit("core_threshold", a.core_threshold)?;
        if a.max_activations == 0 {
            return Err(MemoryError::Validation("max_activations must be > 0".into()));
        }

        let c = &self.connections;
        check_unit("existing_weight", c.existing_weight)?;
        check_unit("contribution_weight", c.contribution_weight)?;
        check_unit("parent_edge_strength", c.parent_edge_strength)?;
        if ((c.existing_weight + c.contribution_weight) - 1.0).abs() > 1e-9 {
            return Err(MemoryError::Validation(format!(
                "blend weights must sum to 1.0 (got {} + {})",
                c.existing_weight, c.contribution_weight
            )));
        }

        let k = &self.consolidation;
        if k.episodic_decay_rate <= 0.0 || k.semantic_decay_rate <= 0.0 {
            return Err(MemoryError::Validation("decay rates must be > 0".into()));
        }
        if k.connection_decay_rate < 0.0 {
            return Err(MemoryError::Validation(
                "connection_decay_rate must be >= 0".into(),
            ));
        }
        check_unit("retirement_floor", k.retirement_floor)?;
        check_unit("min_connection_strength", k.min_connection_strength)?;
        if k.retirement_ttl_days < 0 {
            return Err(MemoryError::Validation(
                "retirement_ttl_days must be >= 0".into(),
            ));
        }

        Ok(())
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(MemoryError::Validation(format!(
            "{} must be within [0, 1] (got {})",
            name, value
        )))
    }
}

fn overlay<T: FromStr>(target: &mut T, var: &str) {
    let mut value = None;
    overlay_opt(&mut value, var);
    if let Some(v) = value {
        *target = v;
    }
}

fn overlay_opt<T: FromStr>(target: &mut Option<T>, var: &str) {
    let Ok(raw) = std::env::var(var) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => *target = Some(v),
        Err(_) => tracing::warn!(var, value = %raw, "Ignoring unparsable environment override"),
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
