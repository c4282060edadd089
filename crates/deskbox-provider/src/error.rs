//! Error types for deskbox-provider.

use thiserror::Error;

/// Result type alias for deskbox-provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur while provisioning or tearing down a container.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The container runtime could not be reached
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The desktop image could not be pulled
    #[error("failed to pull image {image}: {message}")]
    ImagePull { image: String, message: String },

    /// A published port could not be resolved on the host
    #[error("port allocation failed: {0}")]
    PortAllocation(String),

    /// Failed to create the container
    #[error("failed to create container: {0}")]
    Create(String),

    /// Failed to start the container
    #[error("failed to start container: {0}")]
    Start(String),

    /// Failed to stop or remove the container
    #[error("failed to remove container: {0}")]
    Remove(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}
