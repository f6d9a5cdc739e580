//! Error types for burrow.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for burrow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the storage subsystem.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Cluster member offline: {0}")]
    OfflineCluster(String),

    #[error("Driver error for volume {volume}: {reason}")]
    Driver { volume: String, reason: String },

    #[error("Missing dependency: {0}")]
    DependencyMissing(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Catalog errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database migration failed: {reason}")]
    MigrationFailed { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Wrap a driver error with the identity of the volume it concerns.
    pub fn driver(volume: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Driver { volume: volume.into(), reason: err.to_string() }
    }

    /// Whether this error is a not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether this error is an unsupported-capability condition.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}
