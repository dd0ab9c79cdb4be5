//! Error types for the cache engine
//!
//! Provides unified error handling using thiserror.

use std::time::Duration;

use thiserror::Error;

// == Cache Error Enum ==
/// Usage errors reported synchronously by the cache engine.
///
/// Failures inside user callbacks never show up here; they are caught and
/// logged at the call site.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key is empty
    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    /// Sliding expiration outside of zero to one year
    #[error("Sliding expiration {0:?} is outside the allowed range of 0 to 365 days")]
    SlidingExpirationOutOfRange(Duration),

    /// Both absolute and sliding expiration were given
    #[error("Both absolute and sliding expiration are specified")]
    ConflictingExpiration,

    /// Dependency already belongs to a cache entry or a parent dependency
    #[error("Dependency is already in use")]
    DependencyInUse,

    /// Dependency was disposed together with its previous owner
    #[error("Dependency has been disposed")]
    DependencyDisposed,

    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// File system watcher could not be created
    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),
}

// == Result Type Alias ==
/// Convenience Result type for the cache engine.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            CacheError::InvalidKey(String::new()).to_string(),
            "Invalid key: \"\""
        );
        assert_eq!(
            CacheError::ConflictingExpiration.to_string(),
            "Both absolute and sliding expiration are specified"
        );
        assert!(CacheError::SlidingExpirationOutOfRange(Duration::from_secs(1))
            .to_string()
            .contains("365 days"));
    }
}
