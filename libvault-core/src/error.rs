//! Error taxonomy for the repository engine.

use std::path::PathBuf;

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Errors that can occur during repository operations
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The requested lifecycle transition is not legal for the item's
    /// current state or status. Raised before any file is touched.
    #[error("Operation rejected: {0}")]
    PreconditionFailed(String),

    #[error("Access denied for user '{user}' on namespace '{namespace}'")]
    PermissionDenied { user: String, namespace: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Metadata or history document exists but cannot be parsed.
    #[error("Corrupt document at {}: {detail}", .path.display())]
    Corrupt { path: PathBuf, detail: String },

    #[error("Remote repository '{0}' is unavailable")]
    RemoteUnavailable(String),

    #[error("Remote repository '{0}' is not registered")]
    UnknownRemote(String),
}

impl RepositoryError {
    /// Convenience constructor for precondition violations.
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    /// Convenience constructor for missing items/commits/snapshots.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}
