//! Crate-wide error types.

use thiserror::Error;

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the session registry, workspace sandbox and
/// orchestration components.
#[derive(Debug, Error)]
pub enum Error {
    /// Session, container, file or directory missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate session id or rename destination already present.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Owner mismatch on session access.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Malformed or escaping path, invalid image reference, invalid
    /// configuration.
    #[error("validation error: {0}")]
    Validation(String),

    /// Container runtime call failed irrecoverably.
    #[error("provisioning error: {0}")]
    Provisioning(String),

    /// A bounded wait elapsed (graceful stop, readiness, shutdown join).
    #[error("timed out: {0}")]
    Timeout(String),

    /// Non-recursive removal of a non-empty directory.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the target simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
