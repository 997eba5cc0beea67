//! Barrage cache error types.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur while appending to or syncing a file cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// IO errors from the physical write
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The item could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The partition keys do not describe a valid location
    #[error("Invalid partition keys {keys:?}: {reason}")]
    InvalidPartition { keys: Vec<String>, reason: String },

    /// The cache was closed and no longer accepts writes
    #[error("File cache is closed")]
    Closed,
}

impl CacheError {
    /// Create an invalid partition error.
    pub fn invalid_partition(keys: &[String], reason: impl Into<String>) -> Self {
        Self::InvalidPartition {
            keys: keys.to_vec(),
            reason: reason.into(),
        }
    }

    /// Whether the error came from encoding rather than from the disk.
    pub fn is_serialization(&self) -> bool {
        matches!(self, Self::Serialization(_))
    }
}
