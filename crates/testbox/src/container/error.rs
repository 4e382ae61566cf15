//! Container runtime error types.

use std::time::Duration;
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

    /// Image was not found.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// The requested port has no published binding.
    #[error("port {0} not found")]
    PortNotFound(String),

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// A port specification could not be parsed.
    #[error("invalid port spec '{spec}': {reason}")]
    InvalidPortSpec { spec: String, reason: String },

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The operation did not finish before its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// The handle was terminated and can no longer be started.
    #[error("container {0} has been terminated")]
    Terminated(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Whether the error means the runtime object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ContainerError::ContainerNotFound(_) | ContainerError::ImageNotFound(_)
        )
    }

    /// Whether the error was caused by malformed request data.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ContainerError::InvalidInput(_) | ContainerError::InvalidPortSpec { .. }
        )
    }
}

/// Heuristic over docker/podman stderr for "object does not exist".
pub(crate) fn stderr_means_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such") || lower.contains("not known") || lower.contains("not found")
}
