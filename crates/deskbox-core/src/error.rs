//! Error types for deskbox-core.

use crate::client::CommandResult;
use crate::session::SessionState;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for deskbox-core operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Control server error codes.
pub(crate) mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const BUSY: i32 = -32001;
    pub const INVALID_HANDLE: i32 = -32002;
    pub const TRANSFER_ERROR: i32 = -32003;
    pub const RECORDING_ACTIVE: i32 = -32004;
    pub const NOT_RECORDING: i32 = -32005;
    pub const OUT_OF_BOUNDS: i32 = -32006;
}

/// Coarse classification of a [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The container could not be created.
    Provision,
    /// The container never became ready.
    SessionStart,
    /// The control channel failed.
    Transport,
    /// A command is already running on the session.
    Busy,
    /// A command ran out of time.
    Timeout,
    /// A window handle is stale or malformed.
    InvalidHandle,
    /// A file transfer failed.
    Transfer,
    /// The request itself was invalid.
    InvalidArgument,
    /// The control server failed internally.
    Server,
    /// The session is no longer usable.
    Closed,
}

impl ErrorKind {
    /// True when the environment, not the caller's action, is at fault.
    pub fn is_environment_failure(self) -> bool {
        matches!(
            self,
            Self::Provision | Self::SessionStart | Self::Transport | Self::Server
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Provision => "provision",
            Self::SessionStart => "session_start",
            Self::Transport => "transport",
            Self::Busy => "busy",
            Self::Timeout => "timeout",
            Self::InvalidHandle => "invalid_handle",
            Self::Transfer => "transfer",
            Self::InvalidArgument => "invalid_argument",
            Self::Server => "server",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Error from the provider while creating the container
    #[error("provisioning failed: {0}")]
    Provision(#[from] deskbox_provider::ProviderError),

    /// Readiness deadline exceeded; the container has been torn down
    #[error("session did not become ready within {timeout:?}: {reason}")]
    SessionStart {
        /// Readiness budget that was exhausted
        timeout: Duration,
        /// Last probe failure
        reason: String,
    },

    /// Network-level failure on the control channel
    #[error("transport error: {0}")]
    Transport(String),

    /// A command is already running on this session
    #[error("a command is already running on this session")]
    Busy,

    /// The command exceeded its timeout; carries the partial output
    #[error("command timed out")]
    Timeout(Box<CommandResult>),

    /// Unknown or stale window handle
    #[error("invalid window handle: {0}")]
    InvalidHandle(String),

    /// File transfer failed; no partial artifact was left behind
    #[error("transfer failed: {message}")]
    Transfer {
        /// Human-readable description
        message: String,
        /// HTTP status for failed URL fetches
        status: Option<u16>,
    },

    /// Recording already active, or none active
    #[error("recording error: {0}")]
    Recording(String),

    /// Invalid argument or configuration
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Any other error reported by the control server
    #[error("server error {code}: {message}")]
    Rpc {
        /// Error code from the server
        code: i32,
        /// Error message from the server
        message: String,
    },

    /// The session is closing or closed
    #[error("session is {0}")]
    Closed(SessionState),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local I/O error during a transfer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Provision(_) => ErrorKind::Provision,
            Self::SessionStart { .. } => ErrorKind::SessionStart,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Busy => ErrorKind::Busy,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::InvalidHandle(_) => ErrorKind::InvalidHandle,
            Self::Transfer { .. } | Self::Io(_) => ErrorKind::Transfer,
            Self::Recording(_) | Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Rpc { .. } | Self::Json(_) => ErrorKind::Server,
            Self::Closed(_) => ErrorKind::Closed,
        }
    }

    /// Map a JSON-RPC error object onto a typed error.
    pub(crate) fn from_rpc(code: i32, message: String, data: Option<&serde_json::Value>) -> Self {
        match code {
            codes::BUSY => Self::Busy,
            codes::INVALID_HANDLE => Self::InvalidHandle(message),
            codes::TRANSFER_ERROR => Self::Transfer {
                message,
                status: data
                    .and_then(|d| d.get("status"))
                    .and_then(|s| s.as_u64())
                    .and_then(|s| u16::try_from(s).ok()),
            },
            codes::RECORDING_ACTIVE | codes::NOT_RECORDING => Self::Recording(message),
            codes::INVALID_PARAMS
            | codes::OUT_OF_BOUNDS
            | codes::INVALID_REQUEST
            | codes::PARSE_ERROR => Self::InvalidArgument(message),
            _ => Self::Rpc { code, message },
        }
    }
}
