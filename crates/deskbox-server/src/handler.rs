//! Request handler for deskbox-server.
//!
//! Routes JSON-RPC requests to desktop, execution, recording and transfer
//! actions. A failing action produces an error response and leaves every
//! other piece of state untouched.

use crate::config::ServerConfig;
use crate::desktop::Desktop;
use crate::exec::{build_command, run_process};
use crate::protocol::{
    error_codes, AbortPushParams, ButtonParams, ClickParams, DirectoryTreeParams, DragParams,
    ExecResult,
    FetchUrlParams, KeyPressParams, LaunchParams, ListDirParams, ListWindowsParams,
    OpenUrlParams, PointParams, PullFileParams, PushFileParams, Request, Response, RpcFailure,
    RunCommandParams, ScrollParams, StopRecordingParams, TypeTextParams, WindowParams,
};
use crate::recording::Recorder;
use crate::transfer;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// Timeout for the in-container HTTP client used by `fetch_url`.
const FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared state behind every connection.
pub struct Handler {
    config: ServerConfig,
    desktop: Desktop,
    recorder: Recorder,
    /// Held for the duration of a `run_command`.
    exec_gate: Mutex<()>,
    http: reqwest::Client,
}

impl Handler {
    /// Create a handler from server configuration.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be initialised.
    pub fn new(config: ServerConfig) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("deskbox-server/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            desktop: Desktop::new(config.display.clone(), config.screen_size),
            recorder: Recorder::new(config.recording_dir.clone(), config.recording_command.clone()),
            exec_gate: Mutex::new(()),
            http,
            config,
        })
    }

    /// Handle a JSON-RPC request and return a response.
    pub async fn handle(&self, req: Request) -> Response {
        debug!(method = %req.method, id = req.id, "handling request");
        trace!(params = ?req.params, "request params");

        if req.jsonrpc != "2.0" {
            warn!(id = req.id, version = %req.jsonrpc, "unsupported jsonrpc version");
            return Response::error(
                req.id,
                error_codes::INVALID_REQUEST,
                format!("unsupported jsonrpc version: {}", req.jsonrpc),
            );
        }

        let started = Instant::now();
        let response = match self.dispatch(&req.method, req.params).await {
            Ok(result) => Response::success(req.id, result),
            Err(failure) => Response::failure(req.id, failure),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &response.error {
            Some(error) => debug!(
                id = req.id,
                method = %req.method,
                code = error.code,
                message = %error.message,
                elapsed_ms,
                "request failed"
            ),
            None => {
                debug!(id = req.id, method = %req.method, elapsed_ms, "request succeeded");
                trace!(result = ?response.result, "response result");
            }
        }
        response
    }

    /// Stop background work before the process exits.
    pub async fn shutdown(&self) {
        if self.recorder.is_active().await {
            info!("stopping active recording before exit");
            self.recorder.shutdown().await;
        }
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RpcFailure> {
        match method {
            "ping" => Ok(json!({"pong": true})),

            "platform" => to_value(self.desktop.platform()),

            "screen_size" => {
                let size = self.desktop.screen_size().await?;
                Ok(json!({"width": size.width, "height": size.height}))
            }

            "cursor_position" => {
                let (x, y) = self.desktop.cursor_position().await?;
                Ok(json!({"x": x, "y": y}))
            }

            "click" => {
                let p: ClickParams = parse(params)?;
                self.desktop.click(p.x, p.y, p.button, p.count).await?;
                Ok(json!({}))
            }

            "move" => {
                let p: PointParams = parse(params)?;
                self.desktop.move_to(p.x, p.y).await?;
                Ok(json!({}))
            }

            "mouse_press" | "mouse_release" => {
                let p: ButtonParams = parse(params)?;
                self.desktop
                    .mouse_button(p.button, method == "mouse_press")
                    .await?;
                Ok(json!({}))
            }

            "drag" => {
                let p: DragParams = parse(params)?;
                self.desktop.drag(p.from, p.to).await?;
                Ok(json!({}))
            }

            "scroll" => {
                let p: ScrollParams = parse(params)?;
                self.desktop.scroll(p.x, p.y, p.direction, p.amount).await?;
                Ok(json!({}))
            }

            "key_press" => {
                let p: KeyPressParams = parse(params)?;
                self.desktop.key_press(&p.keys).await?;
                Ok(json!({}))
            }

            "type_text" => {
                let p: TypeTextParams = parse(params)?;
                self.desktop.type_text(&p.text, p.delay_ms).await?;
                Ok(json!({}))
            }

            "launch" => {
                let p: LaunchParams = parse(params)?;
                let pid = self.desktop.launch(&p.command)?;
                Ok(json!({"pid": pid}))
            }

            "open_url" => {
                let p: OpenUrlParams = parse(params)?;
                let pid = self.desktop.open_url(&p.url)?;
                Ok(json!({"pid": pid}))
            }

            "list_windows" => {
                let p: ListWindowsParams = parse(params)?;
                let windows = self.desktop.list_windows(p.app_hint.as_deref()).await?;
                Ok(json!({"windows": windows}))
            }

            "activate_window" => {
                let p: WindowParams = parse(params)?;
                self.desktop.activate_window(&p.handle).await?;
                Ok(json!({}))
            }

            "active_window" => to_value(self.desktop.active_window().await?),

            "window_geometry" => {
                let p: WindowParams = parse(params)?;
                to_value(self.desktop.window_geometry(&p.handle).await?)
            }

            "close_window" => {
                let p: WindowParams = parse(params)?;
                self.desktop.close_window(&p.handle).await?;
                Ok(json!({}))
            }

            "screenshot" => {
                let data = self.desktop.screenshot().await?;
                Ok(json!({"data": STANDARD.encode(data), "format": "png"}))
            }

            "start_recording" => {
                let size = self.desktop.screen_size().await?;
                let info = self.recorder.start(size, &self.config.display).await?;
                to_value(info)
            }

            "stop_recording" => {
                let p: StopRecordingParams = parse(params)?;
                to_value(self.recorder.stop(&p.recording_id).await?)
            }

            "run_command" => {
                let p: RunCommandParams = parse(params)?;
                to_value(self.run_command(p).await?)
            }

            "push_file" => {
                let p: PushFileParams = parse(params)?;
                let outcome =
                    transfer::push_chunk(&p.path, &p.transfer_id, p.offset, &p.data, p.last)
                        .await?;
                to_value(outcome)
            }

            "abort_push" => {
                let p: AbortPushParams = parse(params)?;
                transfer::abort_push(&p.path, &p.transfer_id).await?;
                Ok(json!({}))
            }

            "pull_file" => {
                let p: PullFileParams = parse(params)?;
                to_value(transfer::pull_chunk(&p.path, p.offset, p.length).await?)
            }

            "fetch_url" => {
                let p: FetchUrlParams = parse(params)?;
                let size = transfer::fetch_url(&self.http, &p.url, &p.path).await?;
                Ok(json!({"size": size}))
            }

            "list_dir" => {
                let p: ListDirParams = parse(params)?;
                let entries = transfer::list_dir(&p.path).await?;
                Ok(json!({"entries": entries}))
            }

            "desktop_path" => to_value(transfer::desktop_path()?),

            "directory_tree" => {
                let p: DirectoryTreeParams = parse(params)?;
                to_value(transfer::directory_tree(&p.path, p.max_depth).await?)
            }

            _ => {
                warn!(method = %method, "unknown method");
                Err(RpcFailure::new(
                    error_codes::METHOD_NOT_FOUND,
                    format!("method not found: {method}"),
                ))
            }
        }
    }

    /// Run one command at a time; a concurrent request gets `BUSY`.
    async fn run_command(&self, p: RunCommandParams) -> Result<ExecResult, RpcFailure> {
        let Ok(_running) = self.exec_gate.try_lock() else {
            warn!("command already running, rejecting");
            return Err(RpcFailure::new(
                error_codes::BUSY,
                "a command is already running in this session",
            ));
        };

        let cmd = build_command(p.interpreter, &p.command, &p.modules, &self.config.python)?;
        let timeout = p
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.command_timeout);
        debug!(interpreter = ?p.interpreter, timeout_ms = timeout.as_millis() as u64, "running command");

        let result = match run_process(cmd, timeout).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "failed to start command");
                ExecResult::error(&format!("failed to start command: {e}"))
            }
        };
        if result.timed_out {
            info!(duration_ms = result.duration_ms, "command timed out");
        }
        Ok(result)
    }
}

/// Deserialize method params. Missing params count as an empty object.
fn parse<T: DeserializeOwned>(params: Value) -> Result<T, RpcFailure> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params)
        .map_err(|e| RpcFailure::invalid_params(format!("invalid params: {e}")))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, RpcFailure> {
    serde_json::to_value(value).map_err(|e| RpcFailure::internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Dimensions;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn make_request(method: &str, params: Value) -> Request {
        Request {
            jsonrpc: "2.0".to_string(),
            id: 1,
            method: method.to_string(),
            params,
        }
    }

    fn handler(dir: &TempDir) -> Handler {
        let config = ServerConfig {
            screen_size: Some(Dimensions {
                width: 1024,
                height: 768,
            }),
            display: ":99".to_string(),
            recording_dir: dir.path().to_path_buf(),
            recording_command: ["sh", "-c", "printf frame > \"$1\"; exec sleep 30", "sh", "{output}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ..ServerConfig::default()
        };
        Handler::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let dir = TempDir::new().unwrap();
        let resp = handler(&dir).handle(make_request("ping", Value::Null)).await;
        assert!(resp.error.is_none());
        assert_eq!(resp.result.unwrap(), json!({"pong": true}));
    }

    #[tokio::test]
    async fn test_run_command_echo() {
        let dir = TempDir::new().unwrap();
        let resp = handler(&dir)
            .handle(make_request("run_command", json!({"command": "echo hello"})))
            .await;
        assert!(resp.error.is_none());
        let result: ExecResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, b"hello\n");
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let dir = TempDir::new().unwrap();
        let resp = handler(&dir)
            .handle(make_request(
                "run_command",
                json!({"command": "printf partial; sleep 30", "timeout_ms": 300}),
            ))
            .await;
        let result: ExecResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.stdout, b"partial");
    }

    #[tokio::test]
    async fn test_method_not_found() {
        let dir = TempDir::new().unwrap();
        let resp = handler(&dir)
            .handle(make_request("unknown_method", json!({})))
            .await;
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let dir = TempDir::new().unwrap();
        let resp = handler(&dir)
            .handle(make_request("run_command", json!({"wrong_param": "value"})))
            .await;
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let dir = TempDir::new().unwrap();
        let mut req = make_request("ping", Value::Null);
        req.jsonrpc = "1.0".to_string();
        let resp = handler(&dir).handle(req).await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_concurrent_command_is_busy() {
        let dir = TempDir::new().unwrap();
        let handler = Arc::new(handler(&dir));

        let running = {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler
                    .handle(make_request("run_command", json!({"command": "sleep 1; echo done"})))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let busy = handler
            .handle(make_request("run_command", json!({"command": "echo second"})))
            .await;
        assert_eq!(busy.error.unwrap().code, error_codes::BUSY);

        let first = running.await.unwrap();
        let result: ExecResult = serde_json::from_value(first.result.unwrap()).unwrap();
        assert_eq!(result.stdout, b"done\n");

        // Gate is released afterwards.
        let after = handler
            .handle(make_request("run_command", json!({"command": "true"})))
            .await;
        assert!(after.error.is_none());
    }

    #[tokio::test]
    async fn test_recording_double_start() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);

        let first = handler
            .handle(make_request("start_recording", Value::Null))
            .await
            .result
            .unwrap();
        let second = handler
            .handle(make_request("start_recording", Value::Null))
            .await;
        assert_eq!(second.error.unwrap().code, error_codes::RECORDING_ACTIVE);

        let path = first["path"].as_str().unwrap().to_string();
        for _ in 0..100 {
            if std::fs::metadata(&path).is_ok_and(|m| m.len() > 0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let stopped = handler
            .handle(make_request(
                "stop_recording",
                json!({"recording_id": first["recording_id"]}),
            ))
            .await;
        assert_eq!(stopped.result.unwrap()["path"], first["path"]);
    }

    #[tokio::test]
    async fn test_out_of_bounds_click() {
        let dir = TempDir::new().unwrap();
        let resp = handler(&dir)
            .handle(make_request("click", json!({"x": 5000, "y": 10})))
            .await;
        assert_eq!(resp.error.unwrap().code, error_codes::OUT_OF_BOUNDS);
    }

    #[tokio::test]
    async fn test_push_then_pull() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        let path = dir.path().join("pushed.txt");
        let path = path.to_str().unwrap();

        let pushed = handler
            .handle(make_request(
                "push_file",
                json!({
                    "path": path,
                    "transfer_id": "abc",
                    "offset": 0,
                    "data": STANDARD.encode(b"payload"),
                    "last": true,
                }),
            ))
            .await
            .result
            .unwrap();
        assert_eq!(pushed["committed"], true);

        let pulled = handler
            .handle(make_request(
                "pull_file",
                json!({"path": path, "offset": 0, "length": 1024}),
            ))
            .await
            .result
            .unwrap();
        assert_eq!(STANDARD.decode(pulled["data"].as_str().unwrap()).unwrap(), b"payload");
        assert_eq!(pulled["eof"], true);
    }

    #[tokio::test]
    async fn test_directory_tree() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/readme.md"), "hi").unwrap();

        let tree = handler(&dir)
            .handle(make_request(
                "directory_tree",
                json!({"path": dir.path().to_str().unwrap()}),
            ))
            .await
            .result
            .unwrap();
        assert_eq!(tree["children"][0]["name"], "docs");
        assert_eq!(tree["children"][0]["children"][0]["name"], "readme.md");
        assert_eq!(tree["children"][0]["children"][0]["size"], 2);
    }

    #[tokio::test]
    async fn test_window_geometry_needs_handle() {
        let dir = TempDir::new().unwrap();
        let resp = handler(&dir)
            .handle(make_request("window_geometry", json!({})))
            .await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);
    }
}
