//! Configuration Module
//!
//! Handles loading and validating cache configuration from environment variables.

use std::env;

use serde::Deserialize;

use crate::error::{CacheError, Result};

/// Default high-water mark for removable entries.
pub const DEFAULT_HIGH_WATER_MARK: usize = 15_000;

/// Default low-water mark eviction stops at.
pub const DEFAULT_LOW_WATER_MARK: usize = 10_000;

/// Private bytes limit reported when none is configured (700 MiB).
pub const DEFAULT_PRIVATE_BYTES_LIMIT: u64 = 734_003_200;

/// Physical memory percentage reported when none is configured.
pub const DEFAULT_PERCENTAGE_PHYSICAL_MEMORY_LIMIT: u64 = 97;

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
/// The memory limits are advisory and are only reported back to hosts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Ignore all absolute and sliding expirations
    pub disable_expiration: bool,
    /// Number of removable entries that triggers eviction
    pub high_water_mark: usize,
    /// Number of removable entries eviction brings the cache down to
    pub low_water_mark: usize,
    /// Private bytes limit, 0 = use the default
    pub private_bytes_limit: u64,
    /// Physical memory percentage limit, 0 = use the default
    pub percentage_physical_memory_limit: u64,
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_DISABLE_EXPIRATION` - Ignore expirations (default: false)
    /// - `CACHE_HIGH_WATER_MARK` - Eviction trigger (default: 15000)
    /// - `CACHE_LOW_WATER_MARK` - Eviction target (default: 10000)
    /// - `CACHE_PRIVATE_BYTES_LIMIT` - Advisory byte limit (default: 0)
    /// - `CACHE_PERCENT_PHYSICAL_MEMORY_LIMIT` - Advisory memory percentage (default: 0)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            disable_expiration: env::var("CACHE_DISABLE_EXPIRATION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.disable_expiration),
            high_water_mark: env::var("CACHE_HIGH_WATER_MARK")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.high_water_mark),
            low_water_mark: env::var("CACHE_LOW_WATER_MARK")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.low_water_mark),
            private_bytes_limit: env::var("CACHE_PRIVATE_BYTES_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.private_bytes_limit),
            percentage_physical_memory_limit: env::var("CACHE_PERCENT_PHYSICAL_MEMORY_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.percentage_physical_memory_limit),
        }
    }

    /// Sets both water marks (builder pattern).
    #[must_use]
    pub fn with_water_marks(mut self, high: usize, low: usize) -> Self {
        self.high_water_mark = high;
        self.low_water_mark = low;
        self
    }

    /// Disables expiration (builder pattern).
    #[must_use]
    pub fn without_expiration(mut self) -> Self {
        self.disable_expiration = true;
        self
    }

    /// Checks that the water marks describe a usable eviction window.
    pub fn validate(&self) -> Result<()> {
        if self.high_water_mark == 0 {
            return Err(CacheError::InvalidConfig(
                "high_water_mark must be greater than zero".to_string(),
            ));
        }
        if self.low_water_mark >= self.high_water_mark {
            return Err(CacheError::InvalidConfig(format!(
                "low_water_mark ({}) must be below high_water_mark ({})",
                self.low_water_mark, self.high_water_mark
            )));
        }
        if self.percentage_physical_memory_limit > 100 {
            return Err(CacheError::InvalidConfig(format!(
                "percentage_physical_memory_limit ({}) must be at most 100",
                self.percentage_physical_memory_limit
            )));
        }
        Ok(())
    }

    /// Private bytes limit with the default applied.
    pub fn effective_private_bytes_limit(&self) -> u64 {
        match self.private_bytes_limit {
            0 => DEFAULT_PRIVATE_BYTES_LIMIT,
            limit => limit,
        }
    }

    /// Physical memory percentage with the default applied.
    pub fn effective_percentage_physical_memory_limit(&self) -> u64 {
        match self.percentage_physical_memory_limit {
            0 => DEFAULT_PERCENTAGE_PHYSICAL_MEMORY_LIMIT,
            limit => limit,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            disable_expiration: false,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            private_bytes_limit: 0,
            percentage_physical_memory_limit: 0,
        }
    }
}
