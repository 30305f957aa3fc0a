//! Error types for the cache stores
//!
//! Provides unified error handling using thiserror.

use std::path::PathBuf;

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for both cache backends.
///
/// Absence is never an error: a missing or expired entry is reported as
/// `None`/`false`/`0` by the operation itself.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Malformed key or argument
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The durable store could not prepare its storage directory
    #[error("Store unavailable: {0}")]
    InvalidStore(String),

    /// A filesystem operation failed
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The size metadata file could not be encoded
    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// The store's worker went away before answering
    #[error("Cache worker stopped before completing the operation")]
    WorkerStopped,
}

impl CacheError {
    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
