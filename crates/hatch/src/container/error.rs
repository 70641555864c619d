//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ContainerError> for crate::error::Error {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::ContainerNotFound(id) => {
                crate::error::Error::NotFound(format!("container {} not found", id))
            }
            ContainerError::InvalidInput(msg) => crate::error::Error::Validation(msg),
            other => crate::error::Error::Provisioning(other.to_string()),
        }
    }
}
