//! Control client for communicating with deskbox-server inside a container.
//!
//! This module implements the connection handshake and JSON-RPC message
//! exchange. It makes exactly one attempt per call; retry policy lives in
//! [`Session`](crate::Session).

use crate::error::{Result, SessionError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Client for one control connection.
pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    next_id: u64,
    server_version: String,
}

/// How a single call failed.
#[derive(Debug)]
pub(crate) enum CallError {
    /// The request was not fully written; the server cannot have acted on it.
    Unsent(String),
    /// The request was written but no usable response arrived.
    Lost(String),
    /// The server answered with an error.
    Remote(SessionError),
}

impl From<CallError> for SessionError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Unsent(message) | CallError::Lost(message) => Self::Transport(message),
            CallError::Remote(e) => e,
        }
    }
}

impl ControlClient {
    /// Connect and perform the `AUTH` handshake.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the connection or handshake fails within
    /// `limit`.
    pub async fn connect(addr: SocketAddr, token: &str, limit: Duration) -> Result<Self> {
        match timeout(limit, Self::try_connect(addr, token)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Transport(format!(
                "handshake with {addr} timed out after {limit:?}"
            ))),
        }
    }

    async fn try_connect(addr: SocketAddr, token: &str) -> Result<Self> {
        tracing::trace!(%addr, "Attempting control connection");
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SessionError::Transport(format!("connect to {addr} failed: {e}")))?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        writer
            .write_all(format!("AUTH {token}\n").as_bytes())
            .await
            .map_err(|e| SessionError::Transport(format!("handshake write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| SessionError::Transport(format!("handshake write failed: {e}")))?;

        let mut response = String::new();
        reader
            .read_line(&mut response)
            .await
            .map_err(|e| SessionError::Transport(format!("handshake read failed: {e}")))?;

        let Some(version) = response.trim_end().strip_prefix("OK") else {
            tracing::debug!(response = %response.trim(), "Handshake failed");
            return Err(SessionError::Transport(format!(
                "handshake rejected: {}",
                response.trim()
            )));
        };

        tracing::debug!(%addr, server_version = version.trim(), "Control handshake successful");
        Ok(Self {
            reader,
            writer,
            next_id: 1,
            server_version: version.trim().to_string(),
        })
    }

    /// Version string the server reported in the handshake.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Send a JSON-RPC request and wait up to `limit` for its response.
    ///
    /// # Errors
    ///
    /// Returns `Transport` on connection failure or timeout, or the typed
    /// error the server reported.
    pub async fn call<P: Serialize, R: DeserializeOwned>(
        &mut self,
        method: &str,
        params: P,
        limit: Duration,
    ) -> Result<R> {
        let params = serde_json::to_value(params)?;
        let result = self.try_call(method, &params, limit).await?;
        serde_json::from_value(result).map_err(SessionError::from)
    }

    /// One request/response exchange, reporting whether the request left.
    pub(crate) async fn try_call(
        &mut self,
        method: &str,
        params: &Value,
        limit: Duration,
    ) -> std::result::Result<Value, CallError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut request_str = serde_json::to_string(&request)
            .map_err(|e| CallError::Remote(SessionError::Json(e)))?;
        request_str.push('\n');
        tracing::debug!(method = %method, id, "Sending RPC request");
        tracing::trace!(request = %request_str.trim_end(), "RPC request body");

        let write = async {
            self.writer.write_all(request_str.as_bytes()).await?;
            self.writer.flush().await
        };
        // The server only acts on newline-terminated lines and the newline
        // goes out last, so a write error means the request was not handled.
        // A timed-out write counts as possibly delivered.
        match timeout(limit, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(CallError::Unsent(format!("{method}: write failed: {e}"))),
            Err(_) => return Err(CallError::Lost(format!("{method}: write timed out"))),
        }

        let mut response_str = String::new();
        match timeout(limit, self.reader.read_line(&mut response_str)).await {
            Ok(Ok(0)) => {
                tracing::warn!(method = %method, id, "Connection closed before response");
                return Err(CallError::Lost(format!("{method}: connection closed")));
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(method = %method, id, error = %e, "RPC read error");
                return Err(CallError::Lost(format!("{method}: read failed: {e}")));
            }
            Err(_) => {
                tracing::warn!(method = %method, id, timeout_ms = limit.as_millis() as u64, "RPC response timeout");
                return Err(CallError::Lost(format!(
                    "{method}: no response within {limit:?}"
                )));
            }
        }

        tracing::trace!(response = %response_str.trim(), "RPC response body");
        let response: RpcResponse = serde_json::from_str(&response_str)
            .map_err(|e| CallError::Lost(format!("{method}: malformed response: {e}")))?;

        if response.id != id {
            return Err(CallError::Lost(format!(
                "{method}: response id {} does not match request {id}",
                response.id
            )));
        }

        if let Some(error) = response.error {
            tracing::debug!(method = %method, id, code = error.code, message = %error.message, "RPC error response");
            return Err(CallError::Remote(SessionError::from_rpc(
                error.code,
                error.message,
                error.data.as_ref(),
            )));
        }

        tracing::debug!(method = %method, id, "RPC call successful");
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Ping the server to check it is responsive.
    pub async fn ping(&mut self, limit: Duration) -> Result<()> {
        let _: PingResponse = self.call("ping", serde_json::json!({}), limit).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: u64,
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i32,
    message: String,
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PingResponse {
    #[allow(dead_code)]
    pong: bool,
}

/// Serde adapter for base64 byte buffers.
pub(crate) mod b64 {
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

/// Result from command execution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "WireCommandResult")]
pub struct CommandResult {
    /// Process exit code; `None` when the process was killed.
    pub exit_code: Option<i32>,
    /// Standard output, byte for byte.
    pub stdout: Vec<u8>,
    /// Standard error, byte for byte.
    pub stderr: Vec<u8>,
    /// Wall-clock run time inside the container.
    pub duration: Duration,
    /// True if the command was killed for exceeding its timeout.
    pub timed_out: bool,
}

impl CommandResult {
    /// Check if the command completed with exit code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// Standard output as text, lossily decoded.
    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Standard error as text, lossily decoded.
    pub fn stderr_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    /// Turn a timed-out result into [`SessionError::Timeout`].
    pub fn ensure_completed(self) -> Result<Self> {
        if self.timed_out {
            Err(SessionError::Timeout(Box::new(self)))
        } else {
            Ok(self)
        }
    }
}

#[derive(Deserialize)]
struct WireCommandResult {
    exit_code: Option<i32>,
    #[serde(with = "b64")]
    stdout: Vec<u8>,
    #[serde(with = "b64")]
    stderr: Vec<u8>,
    duration_ms: u64,
    timed_out: bool,
}

impl From<WireCommandResult> for CommandResult {
    fn from(wire: WireCommandResult) -> Self {
        Self {
            exit_code: wire.exit_code,
            stdout: wire.stdout,
            stderr: wire.stderr,
            duration: Duration::from_millis(wire.duration_ms),
            timed_out: wire.timed_out,
        }
    }
}

/// Opaque window identifier, valid while the window exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowHandle(String);

impl WindowHandle {
    /// The raw handle string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WindowHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A visible window.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Window {
    pub handle: WindowHandle,
    pub title: String,
}

/// File entry from directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// File or directory name.
    pub name: String,
    /// True if this is a directory.
    pub is_dir: bool,
    /// File size in bytes (0 for directories).
    pub size: u64,
}

/// Position and size of a window in screen pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct WindowGeometry {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

/// The session user's desktop directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DesktopPath {
    pub path: String,
    pub writable: bool,
}

/// A node of a recursive directory listing.
#[derive(Debug, Clone, Deserialize)]
pub struct DirNode {
    pub name: String,
    pub is_dir: bool,
    /// File size in bytes (0 for directories).
    pub size: u64,
    /// `None` for files and for directories below the depth limit.
    #[serde(default)]
    pub children: Option<Vec<DirNode>>,
    /// Set when the directory could not be read.
    #[serde(default)]
    pub error: Option<String>,
}

/// Facts about the container host.
#[derive(Debug, Clone, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    pub hostname: String,
}

/// An active recording.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingInfo {
    pub recording_id: String,
    /// Path of the capture file inside the container.
    pub path: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// A finished recording.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingArtifact {
    pub recording_id: String,
    /// Path of the artifact inside the container.
    pub path: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_result_from_wire() {
        let result: CommandResult = serde_json::from_value(json!({
            "exit_code": 0,
            "stdout": "aGVsbG8K",
            "stderr": "",
            "duration_ms": 12,
            "timed_out": false,
        }))
        .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, b"hello\n");
        assert_eq!(result.duration, Duration::from_millis(12));
    }

    #[test]
    fn test_timed_out_result() {
        let result = CommandResult {
            exit_code: None,
            stdout: b"partial".to_vec(),
            stderr: Vec::new(),
            duration: Duration::from_secs(1),
            timed_out: true,
        };
        assert!(!result.success());
        match result.ensure_completed() {
            Err(SessionError::Timeout(partial)) => assert_eq!(partial.stdout, b"partial"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_window_handle_is_transparent() {
        let window: Window =
            serde_json::from_value(json!({"handle": "6291463", "title": "xterm"})).unwrap();
        assert_eq!(window.handle.as_str(), "6291463");
        assert_eq!(serde_json::to_value(&window.handle).unwrap(), json!("6291463"));
    }

    #[tokio::test]
    async fn test_handshake_rejection_is_transport() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut line = String::new();
            BufReader::new(&mut stream)
                .read_line(&mut line)
                .await
                .unwrap();
            stream.write_all(b"ERR invalid token\n").await.unwrap();
        });

        let err = ControlClient::connect(addr, "wrong", Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_lost_response_is_reported_as_lost() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            write_half.write_all(b"OK test\n").await.unwrap();
            line.clear();
            reader.read_line(&mut line).await.unwrap();
            // Drop the connection without answering.
        });

        let mut client = ControlClient::connect(addr, "t", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(client.server_version(), "test");
        let err = client
            .try_call("click", &json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Lost(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_write_timeout_is_reported_as_lost() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            write_half.write_all(b"OK test\n").await.unwrap();
            // Stop reading so the client's socket buffers fill up.
            let _ = done_rx.await;
        });

        let mut client = ControlClient::connect(addr, "t", Duration::from_secs(5))
            .await
            .unwrap();
        let payload = "x".repeat(64 * 1024 * 1024);
        let err = client
            .try_call("push_file", &json!({"data": payload}), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Lost(_)), "{err:?}");
        let _ = done_tx.send(());
    }
}
