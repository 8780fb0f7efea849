//! Index configuration.
//!
//! Serializable so it can be loaded from JSON or (with the `toml` feature)
//! TOML, with every field defaulted.
//!
//! # Example
//!
//! ```rust
//! use spatree::{IndexConfig, WritePolicy};
//!
//! let json = r#"{
//!     "min_entries": 2,
//!     "max_entries": 8,
//!     "write_policy": "deferred",
//!     "cache": { "max_bytes": 1048576 }
//! }"#;
//! let config = IndexConfig::from_json(json).unwrap();
//! assert_eq!(config.dimensions, 2);
//! assert_eq!(config.write_policy, WritePolicy::Deferred);
//! ```

use serde::de::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When mutated node bodies reach storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Every structural change is saved before the operation returns.
    #[default]
    WriteThrough,
    /// Bodies are marked dirty and saved on eviction or `flush`.
    Deferred,
}

/// Byte budget for resident node bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_max_bytes")]
    pub max_bytes: usize,
}

impl CacheConfig {
    const fn default_max_bytes() -> usize {
        64 * 1024 * 1024
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: Self::default_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    /// Number of coordinate axes every shape must have.
    #[serde(default = "IndexConfig::default_dimensions")]
    pub dimensions: usize,

    /// Minimum fan-out `m` of non-root nodes.
    #[serde(default = "IndexConfig::default_min_entries")]
    pub min_entries: usize,

    /// Maximum fan-out `M` of every node.
    #[serde(default = "IndexConfig::default_max_entries")]
    pub max_entries: usize,

    #[serde(default)]
    pub write_policy: WritePolicy,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Bound on lock waits. `None` waits forever.
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,
}

impl IndexConfig {
    const fn default_dimensions() -> usize {
        2
    }

    const fn default_min_entries() -> usize {
        4
    }

    const fn default_max_entries() -> usize {
        16
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    /// Set `m` and `M` together.
    pub fn with_fanout(mut self, min_entries: usize, max_entries: usize) -> Self {
        self.min_entries = min_entries;
        self.max_entries = max_entries;
        self
    }

    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    pub fn with_cache_bytes(mut self, max_bytes: usize) -> Self {
        self.cache.max_bytes = max_bytes;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = Some(timeout.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.dimensions == 0 {
            return Err("Dimensions must be at least 1".to_string());
        }
        if self.max_entries < 2 {
            return Err("max_entries must be at least 2".to_string());
        }
        if self.min_entries < 1 || self.min_entries > self.max_entries / 2 {
            return Err(format!(
                "min_entries must be between 1 and max_entries / 2 ({}), got {}",
                self.max_entries / 2,
                self.min_entries
            ));
        }
        Ok(())
    }

    /// Load configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: IndexConfig = serde_json::from_str(json)?;
        if let Err(e) = config.validate() {
            return Err(Error::custom(e));
        }
        Ok(config)
    }

    /// Save configuration as JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load configuration from TOML string (requires toml feature)
    #[cfg(feature = "toml")]
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        let config: IndexConfig = toml::from_str(toml_str)?;
        if let Err(e) = config.validate() {
            return Err(toml::de::Error::custom(e));
        }
        Ok(config)
    }

    /// Save configuration as TOML string (requires toml feature)
    #[cfg(feature = "toml")]
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimensions: Self::default_dimensions(),
            min_entries: Self::default_min_entries(),
            max_entries: Self::default_max_entries(),
            write_policy: WritePolicy::default(),
            cache: CacheConfig::default(),
            lock_timeout_ms: None,
        }
    }
}
