//! Configuration for the memory hierarchy.
//!
//! Every section and key is optional; missing values take the defaults below.
//!
//! ```toml
//! [working]
//! max_size_mb = 64.0
//! ttl_seconds = 3600
//! eviction_policy = "lru"
//!
//! [routing]
//! thresholds = [0.0, 0.3, 0.6, 0.9]
//!
//! [consolidation]
//! interval_seconds = 300
//!
//! [storage]
//! data_dir = "./memory-data"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use crate::error::{Error, Result};
use crate::memory::EvictionPolicy;
use crate::routing::{RoutingTable, DEFAULT_THRESHOLDS};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub working: WorkingConfig,
    pub routing: RoutingConfig,
    pub consolidation: ConsolidationConfig,
    pub storage: StorageConfig,
    pub semantic: SemanticConfig,
}

/// Working memory capacity, lifetime and eviction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkingConfig {
    /// Byte capacity in megabytes
    pub max_size_mb: f64,
    /// Entry lifetime
    pub ttl_seconds: u64,
    /// Eviction policy, fixed per instance
    pub eviction_policy: EvictionPolicy,
}

impl Default for WorkingConfig {
    fn default() -> Self {
        Self {
            max_size_mb: 64.0,
            ttl_seconds: 3600,
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

impl WorkingConfig {
    pub fn max_size_bytes(&self) -> usize {
        (self.max_size_mb * BYTES_PER_MB).round() as usize
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_seconds as i64)
    }
}

/// Importance cut-points used by the facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Inclusive lower bounds for working, episodic, semantic, persistent
    pub thresholds: Vec<f64>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            thresholds: DEFAULT_THRESHOLDS.to_vec(),
        }
    }
}

/// Background consolidation cadence and promotion tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Seconds between consolidation passes
    pub interval_seconds: u64,
    /// Seconds between working-memory expiry sweeps
    pub cleanup_interval_seconds: u64,
    /// Working-memory pressure that triggers an early pass
    pub pressure_high_water: f64,
    /// Importance added per recorded access when re-evaluating a candidate
    pub access_boost: f64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 300,
            cleanup_interval_seconds: 60,
            pressure_high_water: 0.85,
            access_boost: 0.05,
        }
    }
}

impl ConsolidationConfig {
    pub fn interval(&self) -> StdDuration {
        StdDuration::from_secs(self.interval_seconds)
    }

    pub fn cleanup_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.cleanup_interval_seconds)
    }
}

/// On-disk layout and tier I/O bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding episodic.db, semantic.db and persistent.db.
    /// `None` keeps every tier in memory.
    pub data_dir: Option<PathBuf>,
    /// Per-call timeout for episodic/semantic/persistent operations
    pub tier_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            tier_timeout_ms: 5000,
        }
    }
}

impl StorageConfig {
    pub fn tier_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.tier_timeout_ms)
    }
}

/// Semantic index tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    /// Dimensions of the default hashing embedder
    pub dimensions: usize,
    /// Minimum cosine similarity for a search hit
    pub min_similarity: f64,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            dimensions: 256,
            min_similarity: 0.1,
        }
    }
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn with_max_size_mb(mut self, mb: f64) -> Self {
        self.working.max_size_mb = mb;
        self
    }

    /// Set working capacity in bytes.
    pub fn with_max_size_bytes(mut self, bytes: usize) -> Self {
        self.working.max_size_mb = bytes as f64 / BYTES_PER_MB;
        self
    }

    pub fn with_ttl_seconds(mut self, secs: u64) -> Self {
        self.working.ttl_seconds = secs;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.working.eviction_policy = policy;
        self
    }

    pub fn with_thresholds(mut self, thresholds: Vec<f64>) -> Self {
        self.routing.thresholds = thresholds;
        self
    }

    pub fn with_consolidation_interval(mut self, secs: u64) -> Self {
        self.consolidation.interval_seconds = secs;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage.data_dir = Some(dir.into());
        self
    }

    pub fn with_tier_timeout_ms(mut self, ms: u64) -> Self {
        self.storage.tier_timeout_ms = ms;
        self
    }

    /// Check every value is usable.
    pub fn validate(&self) -> Result<()> {
        if !(self.working.max_size_mb > 0.0) || self.working.max_size_bytes() == 0 {
            return Err(Error::Config(format!(
                "working.max_size_mb must be positive, got {}",
                self.working.max_size_mb
            )));
        }
        if self.working.ttl_seconds == 0 {
            return Err(Error::Config("working.ttl_seconds must be positive".into()));
        }
        RoutingTable::from_thresholds(&self.routing.thresholds)?;
        if self.consolidation.interval_seconds == 0 {
            return Err(Error::Config(
                "consolidation.interval_seconds must be positive".into(),
            ));
        }
        if self.consolidation.cleanup_interval_seconds == 0 {
            return Err(Error::Config(
                "consolidation.cleanup_interval_seconds must be positive".into(),
            ));
        }
        let high_water = self.consolidation.pressure_high_water;
        if !(high_water > 0.0 && high_water <= 1.0) {
            return Err(Error::Config(format!(
                "consolidation.pressure_high_water must be in (0, 1], got {}",
                high_water
            )));
        }
        if !(self.consolidation.access_boost >= 0.0) {
            return Err(Error::Config(
                "consolidation.access_boost must be non-negative".into(),
            ));
        }
        if self.storage.tier_timeout_ms == 0 {
            return Err(Error::Config("storage.tier_timeout_ms must be positive".into()));
        }
        if self.semantic.dimensions == 0 {
            return Err(Error::Config("semantic.dimensions must be positive".into()));
        }
        if !(-1.0..=1.0).contains(&self.semantic.min_similarity) {
            return Err(Error::Config(format!(
                "semantic.min_similarity must be in [-1, 1], got {}",
                self.semantic.min_similarity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = MemoryConfig::default();
        config.validate().unwrap();
        assert_eq!(config.working.max_size_bytes(), 64 * 1024 * 1024);
        assert_eq!(config.routing.thresholds, vec![0.0, 0.3, 0.6, 0.9]);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = MemoryConfig::from_toml_str(
            r#"
            [working]
            ttl_seconds = 90
            eviction_policy = "lfu"

            [consolidation]
            interval_seconds = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.working.ttl_seconds, 90);
        assert_eq!(config.working.eviction_policy, EvictionPolicy::Lfu);
        assert_eq!(config.working.max_size_mb, 64.0);
        assert_eq!(config.consolidation.interval_seconds, 30);
        assert_eq!(config.consolidation.cleanup_interval_seconds, 60);
        assert_eq!(config.storage.data_dir, None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(MemoryConfig::from_toml_str("[working]\neviction_policy = \"random\"").is_err());
        assert!(MemoryConfig::from_toml_str("[working]\nmax_size_mb = 0.0").is_err());
        assert!(MemoryConfig::from_toml_str("[routing]\nthresholds = [0.0, 0.6, 0.3, 0.9]").is_err());
        assert!(MemoryConfig::from_toml_str("[routing]\nthresholds = [0.0, 0.5]").is_err());
        assert!(
            MemoryConfig::from_toml_str("[consolidation]\npressure_high_water = 1.5").is_err()
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.toml");
        std::fs::write(
            &path,
            "[storage]\ndata_dir = \"/var/lib/agent\"\ntier_timeout_ms = 250\n",
        )
        .unwrap();

        let config = MemoryConfig::load(&path).unwrap();
        assert_eq!(config.storage.data_dir, Some(PathBuf::from("/var/lib/agent")));
        assert_eq!(config.storage.tier_timeout(), StdDuration::from_millis(250));
    }

    #[test]
    fn test_byte_capacity_builder() {
        let config = MemoryConfig::new().with_max_size_bytes(1000);
        assert_eq!(config.working.max_size_bytes(), 1000);
    }
}
