//! JSON-RPC 2.0 protocol types for deskbox-server.
//!
//! Requests and responses are newline-delimited JSON objects. Binary payloads
//! travel as base64 strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 standard error codes, plus deskbox application codes.
pub mod error_codes {
    /// Parse error - Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;

    /// A command is already running for this session.
    pub const BUSY: i32 = -32001;
    /// The window handle is malformed or no longer refers to a window.
    pub const INVALID_HANDLE: i32 = -32002;
    /// A file transfer failed; `data.reason` says why.
    pub const TRANSFER_ERROR: i32 = -32003;
    /// A recording is already in progress.
    pub const RECORDING_ACTIVE: i32 = -32004;
    /// No recording is in progress.
    pub const NOT_RECORDING: i32 = -32005;
    /// Coordinates fall outside the screen.
    pub const OUT_OF_BOUNDS: i32 = -32006;
    /// A desktop tool (input, window, capture) failed.
    pub const ACTION_FAILED: i32 = -32007;
}

/// Serde adapter for byte buffers carried as base64 strings.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// Protocol version, must be "2.0".
    pub jsonrpc: String,
    /// Request identifier.
    pub id: u64,
    /// Method name to invoke.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Serialize)]
pub struct Response {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Request identifier (matches request).
    pub id: u64,
    /// Result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Create a success response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self::failure(id, RpcFailure::new(code, message))
    }

    /// Create an error response from a typed failure.
    pub fn failure(id: u64, failure: RpcFailure) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code: failure.code,
                message: failure.message,
                data: failure.data,
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct RpcError {
    /// Error code.
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
    /// Additional error data (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A failed action, before it is attached to a request id.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcFailure {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }

    pub fn action_failed(message: impl Into<String>) -> Self {
        Self::new(error_codes::ACTION_FAILED, message)
    }

    pub fn invalid_handle(handle: &str) -> Self {
        Self::new(
            error_codes::INVALID_HANDLE,
            format!("unknown window handle: {handle}"),
        )
    }

    /// A transfer failure with a machine-readable reason.
    pub fn transfer(reason: TransferFailure, message: impl Into<String>) -> Self {
        Self::new(error_codes::TRANSFER_ERROR, message)
            .with_data(serde_json::json!({ "reason": reason }))
    }
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Why a transfer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferFailure {
    NotFound,
    Io,
    Network,
    HttpStatus,
}

/// Mouse button.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

/// Scroll direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    #[default]
    Down,
    Left,
    Right,
}

/// How the command text is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpreter {
    #[default]
    Shell,
    Python,
}

/// Result of command execution.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecResult {
    /// Process exit code; absent when the process was killed.
    pub exit_code: Option<i32>,
    /// Standard output.
    #[serde(with = "b64")]
    pub stdout: Vec<u8>,
    /// Standard error.
    #[serde(with = "b64")]
    pub stderr: Vec<u8>,
    /// Wall-clock run time.
    pub duration_ms: u64,
    /// True if the process was killed for exceeding its timeout.
    pub timed_out: bool,
}

impl ExecResult {
    /// Create an error result (for when the process could not be started).
    pub fn error(message: &str) -> Self {
        Self {
            exit_code: Some(-1),
            stdout: Vec::new(),
            stderr: message.as_bytes().to_vec(),
            duration_ms: 0,
            timed_out: false,
        }
    }
}

/// File entry for directory listing.
#[derive(Debug, Serialize)]
pub struct FileEntry {
    /// File or directory name.
    pub name: String,
    /// True if this is a directory.
    pub is_dir: bool,
    /// File size in bytes (0 for directories).
    pub size: u64,
}

/// Window summary for `list_windows`.
#[derive(Debug, Serialize)]
pub struct WindowInfo {
    /// Opaque window handle.
    pub handle: String,
    /// Window title.
    pub title: String,
}

/// Position and size of a window, from `getwindowgeometry`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct WindowGeometry {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

/// One node of a `directory_tree` result.
#[derive(Debug, Serialize)]
pub struct DirNode {
    pub name: String,
    pub is_dir: bool,
    /// File size in bytes (0 for directories).
    pub size: u64,
    /// Sorted children; absent for files and for directories past the depth limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<DirNode>>,
    /// Why a directory could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// Parameter types for various methods

/// Parameters for the `click` method.
#[derive(Debug, Deserialize)]
pub struct ClickParams {
    pub x: Option<i64>,
    pub y: Option<i64>,
    #[serde(default)]
    pub button: MouseButton,
    /// Number of clicks (2 for double click).
    #[serde(default = "one")]
    pub count: u32,
}

/// Parameters for the `move` method.
#[derive(Debug, Deserialize)]
pub struct PointParams {
    pub x: i64,
    pub y: i64,
}

/// Parameters for `mouse_press` and `mouse_release`.
#[derive(Debug, Deserialize)]
pub struct ButtonParams {
    #[serde(default)]
    pub button: MouseButton,
}

/// Parameters for the `drag` method.
#[derive(Debug, Deserialize)]
pub struct DragParams {
    pub from: (i64, i64),
    pub to: (i64, i64),
}

/// Parameters for the `scroll` method.
#[derive(Debug, Deserialize)]
pub struct ScrollParams {
    pub x: Option<i64>,
    pub y: Option<i64>,
    #[serde(default)]
    pub direction: ScrollDirection,
    #[serde(default = "one")]
    pub amount: u32,
}

/// Parameters for the `key_press` method.
#[derive(Debug, Deserialize)]
pub struct KeyPressParams {
    /// Keys pressed together, in order.
    pub keys: Vec<String>,
}

/// Parameters for the `type_text` method.
#[derive(Debug, Deserialize)]
pub struct TypeTextParams {
    pub text: String,
    #[serde(default = "default_type_delay")]
    pub delay_ms: u64,
}

/// Parameters for the `launch` method.
#[derive(Debug, Deserialize)]
pub struct LaunchParams {
    pub command: String,
}

/// Parameters for the `open_url` method.
#[derive(Debug, Deserialize)]
pub struct OpenUrlParams {
    pub url: String,
}

/// Parameters for the `list_windows` method.
#[derive(Debug, Default, Deserialize)]
pub struct ListWindowsParams {
    /// Window class to filter by; all visible windows when absent.
    #[serde(default)]
    pub app_hint: Option<String>,
}

/// Parameters for `activate_window` and `close_window`.
#[derive(Debug, Deserialize)]
pub struct WindowParams {
    pub handle: String,
}

/// Parameters for the `stop_recording` method.
#[derive(Debug, Deserialize)]
pub struct StopRecordingParams {
    pub recording_id: String,
}

/// Parameters for the `run_command` method.
#[derive(Debug, Deserialize)]
pub struct RunCommandParams {
    pub command: String,
    #[serde(default)]
    pub interpreter: Interpreter,
    /// Modules imported before the code runs (python only).
    #[serde(default)]
    pub modules: Vec<String>,
    pub timeout_ms: Option<u64>,
}

/// Parameters for the `push_file` method.
#[derive(Debug, Deserialize)]
pub struct PushFileParams {
    pub path: String,
    pub transfer_id: String,
    pub offset: u64,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    pub last: bool,
}

/// Parameters for the `abort_push` method.
#[derive(Debug, Deserialize)]
pub struct AbortPushParams {
    pub path: String,
    pub transfer_id: String,
}

/// Parameters for the `pull_file` method.
#[derive(Debug, Deserialize)]
pub struct PullFileParams {
    pub path: String,
    #[serde(default)]
    pub offset: u64,
    pub length: u64,
}

/// Parameters for the `fetch_url` method.
#[derive(Debug, Deserialize)]
pub struct FetchUrlParams {
    pub url: String,
    pub path: String,
}

/// Parameters for the `list_dir` method.
#[derive(Debug, Deserialize)]
pub struct ListDirParams {
    /// Path to the directory to list.
    pub path: String,
}

/// Parameters for the `directory_tree` method.
#[derive(Debug, Deserialize)]
pub struct DirectoryTreeParams {
    pub path: String,
    /// Levels below `path` to descend into.
    #[serde(default = "default_tree_depth")]
    pub max_depth: u32,
}

fn default_tree_depth() -> u32 {
    8
}

fn one() -> u32 {
    1
}

fn default_type_delay() -> u64 {
    75
}
