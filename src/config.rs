//! Configuration management for cache zones

use crate::error::{CacheError, Result};
use crate::storage::layout;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Number of LRU tiers used by the tiered eviction algorithm
pub const TIER_COUNT: usize = 4;

/// Smallest accepted zone capacity, two parts per tier
pub const MIN_STORAGE_OBJECTS: u64 = 2 * TIER_COUNT as u64;

/// Top level configuration: the upstream origin and the cache zones
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Base URL of the upstream origin, e.g. "http://origin.example.com"
    #[serde(default)]
    pub upstream_url: Option<String>,

    /// Upstream request timeout in seconds (default: 30)
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// Configured cache zones
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
}

/// Eviction algorithm used by a zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    /// Tiered LRU with [`TIER_COUNT`] tiers
    Lru,
}

/// Configuration of a single cache zone
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZoneConfig {
    /// Zone identifier, also used as the cache key namespace
    pub id: String,

    /// Root directory of the zone on disk
    pub path: PathBuf,

    /// Size of one stored part in bytes (default: 2MB)
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Maximum number of parts tracked by the zone (default: 4096)
    #[serde(default = "default_storage_objects")]
    pub storage_objects: u64,

    /// Eviction algorithm (default: lru)
    #[serde(default = "default_algorithm")]
    pub algorithm: AlgorithmKind,
}

impl ZoneConfig {
    /// Create a zone configuration with default part size and capacity
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        ZoneConfig {
            id: id.into(),
            path: path.into(),
            part_size: default_part_size(),
            storage_objects: default_storage_objects(),
            algorithm: default_algorithm(),
        }
    }

    /// Validate the zone configuration
    ///
    /// # Validation Rules
    /// - id must not be empty and must be usable as a directory name
    /// - part_size must be between 1 byte and 64MB
    /// - storage_objects must hold at least two parts per tier
    pub fn validate(&self) -> Result<()> {
        const MAX_PART_SIZE: u64 = 64 * 1024 * 1024; // 64MB

        if !layout::is_plain_dir_name(&self.id) {
            return Err(CacheError::Config(format!(
                "zone id '{}' must be a non-empty plain directory name",
                self.id
            )));
        }

        if self.part_size == 0 || self.part_size > MAX_PART_SIZE {
            return Err(CacheError::Config(format!(
                "zone {}: part_size must be between 1 byte and {}MB, got {} bytes",
                self.id,
                MAX_PART_SIZE / (1024 * 1024),
                self.part_size
            )));
        }

        // With one part per tier the newest part is the one evicted
        if self.storage_objects < MIN_STORAGE_OBJECTS {
            return Err(CacheError::Config(format!(
                "zone {}: storage_objects must be at least {}, got {}",
                self.id, MIN_STORAGE_OBJECTS, self.storage_objects
            )));
        }

        Ok(())
    }
}

// Default value functions for serde
fn default_part_size() -> u64 {
    2 * 1024 * 1024 // 2MB
}

fn default_storage_objects() -> u64 {
    4096
}

fn default_algorithm() -> AlgorithmKind {
    AlgorithmKind::Lru
}

fn default_upstream_timeout() -> u64 {
    30
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            upstream_url: None,
            upstream_timeout_secs: default_upstream_timeout(),
            zones: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(CacheConfig)` if loading and validation succeed
    /// * `Err(CacheError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            CacheError::Config(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(content).map_err(|e| {
            CacheError::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - every zone must be valid
    /// - zone ids and zone paths must be unique
    /// - upstream_url, when set, must be an http(s) URL
    /// - upstream_timeout_secs must be > 0
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut paths = HashSet::new();

        for zone in &self.zones {
            zone.validate()?;

            if !ids.insert(zone.id.as_str()) {
                return Err(CacheError::Config(format!(
                    "duplicate zone id '{}'",
                    zone.id
                )));
            }

            if !paths.insert(zone.path.as_path()) {
                return Err(CacheError::Config(format!(
                    "zone {}: path {} is used by another zone",
                    zone.id,
                    zone.path.display()
                )));
            }
        }

        if let Some(url) = &self.upstream_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(CacheError::Config(format!(
                    "upstream_url must start with http:// or https://, got {}",
                    url
                )));
            }
        }

        if self.upstream_timeout_secs == 0 {
            return Err(CacheError::Config(
                "upstream_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let yaml = r#"
upstream_url: "http://origin.example.com"
zones:
  - id: default
    path: /var/cache/zone-cache/default
  - id: video
    path: /var/cache/zone-cache/video
    part_size: 4194304
    storage_objects: 1000
    algorithm: lru
"#;
        let config = CacheConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.zones.len(), 2);
        assert_eq!(config.upstream_timeout_secs, 30);

        let default_zone = &config.zones[0];
        assert_eq!(default_zone.part_size, 2 * 1024 * 1024);
        assert_eq!(default_zone.storage_objects, 4096);
        assert_eq!(default_zone.algorithm, AlgorithmKind::Lru);

        assert_eq!(config.zones[1].part_size, 4 * 1024 * 1024);
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let yaml = r#"
zones:
  - id: z
    path: /tmp/z
    algorithm: arc
"#;
        assert!(CacheConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_duplicate_zone_ids_rejected() {
        let config = CacheConfig {
            zones: vec![ZoneConfig::new("a", "/tmp/a"), ZoneConfig::new("a", "/tmp/b")],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_zone_validation() {
        let mut zone = ZoneConfig::new("z", "/tmp/z");
        assert!(zone.validate().is_ok());

        zone.part_size = 0;
        assert!(zone.validate().is_err());

        zone.part_size = 1024;
        zone.storage_objects = 3;
        assert!(zone.validate().is_err());
        zone.storage_objects = TIER_COUNT as u64;
        assert!(zone.validate().is_err());
        zone.storage_objects = MIN_STORAGE_OBJECTS;
        assert!(zone.validate().is_ok());

        let zone = ZoneConfig::new("../escape", "/tmp/z");
        assert!(zone.validate().is_err());
    }

    #[test]
    fn test_bad_upstream_url() {
        let config = CacheConfig {
            upstream_url: Some("origin:80".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
