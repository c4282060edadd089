//! Error types for deskbox-server startup.
//!
//! Per-request failures are [`RpcFailure`](crate::protocol::RpcFailure)
//! values and never reach this type.

use thiserror::Error;

/// Errors that prevent the server from starting or serving.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
