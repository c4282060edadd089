//! End-to-end session tests against an in-process control server.
//!
//! `LocalProvider` stands in for the container runtime: "provisioning" binds
//! a real `deskbox-server` on 127.0.0.1 and "terminating" shuts it down.

use async_trait::async_trait;
use deskbox_core::{
    ErrorKind, MouseButton, Provider, Session, SessionConfig, SessionState, WindowHandle,
};
use deskbox_provider::{probe_endpoint, ContainerHandle, ProviderError, ProvisionConfig};
use deskbox_server::{Dimensions, Server, ServerConfig};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Runs the control server on the host instead of in a container.
struct LocalProvider {
    recordings: TempDir,
    running: Mutex<HashMap<String, oneshot::Sender<()>>>,
    provisioned: AtomicUsize,
    terminated: AtomicUsize,
    terminated_at: Mutex<Option<Instant>>,
}

impl LocalProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            recordings: TempDir::new().unwrap(),
            running: Mutex::new(HashMap::new()),
            provisioned: AtomicUsize::new(0),
            terminated: AtomicUsize::new(0),
            terminated_at: Mutex::new(None),
        })
    }

    fn server_config(&self, config: &ProvisionConfig) -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            session_token: Some(config.session_token.clone()),
            screen_size: Some(Dimensions {
                width: config.screen_size.width,
                height: config.screen_size.height,
            }),
            recording_dir: self.recordings.path().to_path_buf(),
            recording_command: [
                "sh",
                "-c",
                "printf frame > \"$1\"; exec sleep 30",
                "sh",
                "{output}",
            ]
            .map(String::from)
            .to_vec(),
            ..ServerConfig::default()
        }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn provision(&self, config: &ProvisionConfig) -> deskbox_provider::Result<ContainerHandle> {
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        let server = Server::bind(self.server_config(config))
            .await
            .map_err(|e| ProviderError::Create(e.to_string()))?;
        let addr = server
            .local_addr()
            .map_err(|e| ProviderError::Create(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        tokio::spawn(server.run(async {
            let _ = rx.await;
        }));
        self.running
            .lock()
            .unwrap()
            .insert(config.session_id.clone(), tx);

        Ok(ContainerHandle {
            session_id: config.session_id.clone(),
            container_id: format!("local-{}", addr.port()),
            control_endpoint: addr,
            display_endpoint: None,
            browser_endpoint: None,
            session_token: config.session_token.clone(),
            auto_ssl: config.auto_ssl,
        })
    }

    async fn health_check(&self, handle: &ContainerHandle) -> bool {
        probe_endpoint(handle.control_endpoint).await
    }

    async fn terminate(&self, handle: &ContainerHandle) -> deskbox_provider::Result<()> {
        self.terminated.fetch_add(1, Ordering::SeqCst);
        *self.terminated_at.lock().unwrap() = Some(Instant::now());
        if let Some(shutdown) = self.running.lock().unwrap().remove(&handle.session_id) {
            let _ = shutdown.send(());
        }
        Ok(())
    }

    async fn list(&self) -> deskbox_provider::Result<Vec<String>> {
        Ok(self.running.lock().unwrap().keys().cloned().collect())
    }
}

/// Hands out an endpoint nothing listens on.
#[derive(Default)]
struct DeadProvider {
    terminated: AtomicUsize,
}

#[async_trait]
impl Provider for DeadProvider {
    fn name(&self) -> &str {
        "dead"
    }

    async fn provision(&self, config: &ProvisionConfig) -> deskbox_provider::Result<ContainerHandle> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        drop(listener);
        Ok(ContainerHandle {
            session_id: config.session_id.clone(),
            container_id: "dead".into(),
            control_endpoint: addr,
            display_endpoint: None,
            browser_endpoint: None,
            session_token: config.session_token.clone(),
            auto_ssl: false,
        })
    }

    async fn health_check(&self, handle: &ContainerHandle) -> bool {
        probe_endpoint(handle.control_endpoint).await
    }

    async fn terminate(&self, _handle: &ContainerHandle) -> deskbox_provider::Result<()> {
        self.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self) -> deskbox_provider::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// A control server with canned replies that drops the connection the
/// first time it sees each method in `drop_once`, after reading the request.
struct ScriptedProvider {
    drop_once: &'static [&'static str],
    calls: Arc<Mutex<HashMap<String, usize>>>,
}

impl ScriptedProvider {
    fn new(drop_once: &'static [&'static str]) -> Arc<Self> {
        Arc::new(Self {
            drop_once,
            calls: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn calls(&self, method: &str) -> usize {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }
}

async fn serve_scripted(
    listener: TcpListener,
    drop_once: &'static [&'static str],
    calls: Arc<Mutex<HashMap<String, usize>>>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            // Health probes connect and hang up without a handshake.
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            if write_half.write_all(b"OK scripted\n").await.is_err() {
                return;
            }
            loop {
                line.clear();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return;
                }
                let request: Value = serde_json::from_str(&line).unwrap();
                let method = request["method"].as_str().unwrap_or_default().to_string();
                let seen = {
                    let mut calls = calls.lock().unwrap();
                    let count = calls.entry(method.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                if seen == 1 && drop_once.contains(&method.as_str()) {
                    return;
                }
                let result = match method.as_str() {
                    "ping" => json!({"pong": true}),
                    "cursor_position" => json!({"x": 1, "y": 2}),
                    _ => json!({}),
                };
                let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": result});
                if write_half
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn provision(&self, config: &ProvisionConfig) -> deskbox_provider::Result<ContainerHandle> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| ProviderError::Create(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ProviderError::Create(e.to_string()))?;
        tokio::spawn(serve_scripted(listener, self.drop_once, Arc::clone(&self.calls)));

        Ok(ContainerHandle {
            session_id: config.session_id.clone(),
            container_id: "scripted".into(),
            control_endpoint: addr,
            display_endpoint: None,
            browser_endpoint: None,
            session_token: config.session_token.clone(),
            auto_ssl: false,
        })
    }

    async fn health_check(&self, handle: &ContainerHandle) -> bool {
        probe_endpoint(handle.control_endpoint).await
    }

    async fn terminate(&self, _handle: &ContainerHandle) -> deskbox_provider::Result<()> {
        Ok(())
    }

    async fn list(&self) -> deskbox_provider::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

fn test_config() -> SessionConfig {
    SessionConfig::builder()
        .screen_size("1280x720".parse().unwrap())
        .startup_timeout(Duration::from_secs(10))
        .rpc_timeout(Duration::from_secs(10))
        .close_grace(Duration::from_secs(5))
        .build()
        .unwrap()
}

async fn open(provider: &Arc<LocalProvider>) -> Session {
    Session::open_with(provider.clone(), test_config()).await.unwrap()
}

#[tokio::test]
async fn test_open_ready_and_close_twice() {
    let provider = LocalProvider::new();
    let session = open(&provider).await;
    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.health().await);
    assert_eq!(provider.list().await.unwrap(), vec![session.id().to_string()]);

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(provider.list().await.unwrap().is_empty());

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(provider.list().await.unwrap().is_empty());
    assert_eq!(provider.terminated.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_calls_after_close_fail_with_closed() {
    let provider = LocalProvider::new();
    let session = open(&provider).await;
    session.close().await;

    let err = session.execute_command("true").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
    assert!(!session.health().await);
}

#[tokio::test]
async fn test_startup_failure_leaves_nothing_running() {
    let provider = Arc::new(DeadProvider::default());
    let config = SessionConfig::builder()
        .startup_timeout(Duration::from_secs(1))
        .build()
        .unwrap();

    let err = Session::open_with(provider.clone(), config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionStart);
    assert!(err.kind().is_environment_failure());
    assert_eq!(provider.terminated.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalid_config_never_provisions() {
    let provider = LocalProvider::new();
    let mut config = SessionConfig::default();
    config.rpc_timeout = Duration::ZERO;

    let err = Session::open_with(provider.clone(), config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let mut config = SessionConfig::default();
    config.startup_timeout = Duration::MAX;
    let err = Session::open_with(provider.clone(), config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(provider.provisioned.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_out_of_range_durations_rejected() {
    let provider = LocalProvider::new();
    let session = open(&provider).await;

    let err = session
        .execute_command_with_timeout("true", Duration::MAX)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = session
        .execute_command_with_timeout("true", Duration::ZERO)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = session
        .type_text("abc", Duration::from_secs(3600))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // Rejections happen before the command slot is taken.
    let result = session.execute_command("echo ok").await.unwrap();
    assert_eq!(result.stdout, b"ok\n");
    assert_eq!(session.state(), SessionState::Ready);

    session.close().await;
}

#[tokio::test]
async fn test_echo_round_trip() {
    let provider = LocalProvider::new();
    let session = open(&provider).await;

    let result = session.execute_command("echo hello").await.unwrap();
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, b"hello\n");
    assert!(result.stderr.is_empty());

    let result = session.execute_command("echo oops >&2; exit 3").await.unwrap();
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.stderr_str(), "oops\n");

    let result = session.execute_command("printf '\\000\\377'").await.unwrap();
    assert_eq!(result.stdout, vec![0u8, 0xff]);

    session.close().await;
}

#[tokio::test]
async fn test_concurrent_command_is_busy() {
    let provider = LocalProvider::new();
    let session = Arc::new(open(&provider).await);

    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.execute_command("sleep 1; echo done").await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = session.execute_command("echo second").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert!(!err.kind().is_environment_failure());

    let result = first.await.unwrap().unwrap();
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, b"done\n");

    session.close().await;
}

#[tokio::test]
async fn test_close_waits_for_running_command() {
    let provider = LocalProvider::new();
    let session = Arc::new(open(&provider).await);

    let running = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            let result = session.execute_command("sleep 1; echo done").await;
            (result, Instant::now())
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let start = Instant::now();
    session.close().await;
    assert!(start.elapsed() >= Duration::from_millis(500));
    assert_eq!(session.state(), SessionState::Closed);

    let (result, finished_at) = running.await.unwrap();
    assert_eq!(result.unwrap().stdout, b"done\n");
    let terminated_at = provider.terminated_at.lock().unwrap().unwrap();
    assert!(finished_at <= terminated_at);
}

#[tokio::test]
async fn test_lost_response_retried_only_when_idempotent() {
    let provider = ScriptedProvider::new(&["cursor_position", "click"]);
    let session = Session::open_with(provider.clone(), test_config())
        .await
        .unwrap();

    // A query is resent once on a fresh connection.
    assert_eq!(session.cursor_position().await.unwrap(), (1, 2));
    assert_eq!(provider.calls("cursor_position"), 2);

    // A click may already have happened, so it is not replayed.
    let err = session.click(10, 10, MouseButton::Left).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(provider.calls("click"), 1);

    // The next call reconnects.
    session.click(10, 10, MouseButton::Left).await.unwrap();
    assert_eq!(provider.calls("click"), 2);
    assert_eq!(session.state(), SessionState::Ready);

    session.close().await;
}

#[tokio::test]
async fn test_timeout_returns_partial_output() {
    let provider = LocalProvider::new();
    let session = open(&provider).await;

    let start = Instant::now();
    let result = session
        .execute_command_with_timeout("echo partial; sleep 30", Duration::from_millis(500))
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(result.timed_out);
    assert_eq!(result.exit_code, None);
    assert_eq!(result.stdout, b"partial\n");

    let err = result.ensure_completed().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    // The session stays usable.
    let result = session.execute_command("echo after").await.unwrap();
    assert_eq!(result.stdout, b"after\n");

    session.close().await;
}

#[tokio::test]
async fn test_upload_download_round_trip() {
    let provider = LocalProvider::new();
    let session = open(&provider).await;
    let dir = TempDir::new().unwrap();

    let content: Vec<u8> = (0..(2 * 1024 * 1024 + 4321)).map(|i| (i % 251) as u8).collect();
    let local = dir.path().join("input.bin");
    std::fs::write(&local, &content).unwrap();

    let remote = dir.path().join("remote/nested/copy.bin");
    let remote = remote.to_str().unwrap();
    let written = session.upload(&local, remote).await.unwrap();
    assert_eq!(written, content.len() as u64);

    let local2 = dir.path().join("output.bin");
    let read = session.download(remote, &local2).await.unwrap();
    assert_eq!(read, content.len() as u64);
    assert_eq!(std::fs::read(&local2).unwrap(), content);

    let entries = session
        .list_dir(dir.path().join("remote/nested").to_str().unwrap())
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "copy.bin");

    let tree = session
        .directory_tree(dir.path().join("remote").to_str().unwrap(), 4)
        .await
        .unwrap();
    let nested = &tree.children.unwrap()[0];
    assert_eq!(nested.name, "nested");
    let files = nested.children.as_ref().unwrap();
    assert_eq!(files[0].name, "copy.bin");
    assert_eq!(files[0].size, content.len() as u64);

    session.close().await;
}

#[tokio::test]
async fn test_empty_file_round_trip() {
    let provider = LocalProvider::new();
    let session = open(&provider).await;
    let dir = TempDir::new().unwrap();

    let local = dir.path().join("empty");
    std::fs::write(&local, b"").unwrap();
    let remote = dir.path().join("empty.remote");
    session.upload(&local, remote.to_str().unwrap()).await.unwrap();

    let local2 = dir.path().join("empty.back");
    session.download(remote.to_str().unwrap(), &local2).await.unwrap();
    assert!(std::fs::read(&local2).unwrap().is_empty());

    session.close().await;
}

#[tokio::test]
async fn test_failed_transfers_leave_no_artifact() {
    let provider = LocalProvider::new();
    let session = open(&provider).await;
    let dir = TempDir::new().unwrap();

    let local = dir.path().join("never.bin");
    let err = session
        .download(dir.path().join("missing").to_str().unwrap(), &local)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transfer);
    assert!(!local.exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    let err = session
        .upload(dir.path().join("no-such-file"), "/tmp/never")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transfer);

    session.close().await;
}

#[tokio::test]
async fn test_double_start_recording_keeps_first() {
    let provider = LocalProvider::new();
    let session = open(&provider).await;
    let dir = TempDir::new().unwrap();

    let info = session.start_recording().await.unwrap();
    let err = session.start_recording().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // Give the recorder a moment to write its first frame.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let local = dir.path().join("capture.mp4");
    let artifact = session.end_recording(&local).await.unwrap();
    assert_eq!(artifact.recording_id, info.recording_id);
    assert_eq!(std::fs::read(&local).unwrap(), b"frame");

    let err = session.end_recording(&local).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    session.close().await;
}

#[tokio::test]
async fn test_close_stops_active_recording() {
    let provider = LocalProvider::new();
    let session = open(&provider).await;

    session.start_recording().await.unwrap();
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(provider.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_action_errors_do_not_abort_session() {
    let provider = LocalProvider::new();
    let session = open(&provider).await;

    let err = session
        .click(5000, 5000, MouseButton::Left)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = session
        .activate_window(&WindowHandle::from("0"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);

    let err = session
        .window_geometry(&WindowHandle::from("0"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);

    let err = session.key_press(&[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let size = session.screen_size().await.unwrap();
    assert_eq!((size.width, size.height), (1280, 720));
    assert!(!session.platform().await.unwrap().os.is_empty());
    assert_eq!(session.state(), SessionState::Ready);

    session.close().await;
}

#[tokio::test]
#[ignore = "requires a Docker daemon and the desktop image"]
async fn test_docker_window_lifecycle() {
    let session = Session::open(SessionConfig::default()).await.unwrap();

    session.launch("xterm").await.unwrap();
    let mut window = None;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let windows = session.list_windows(Some("xterm")).await.unwrap();
        if let Some(w) = windows.into_iter().next() {
            window = Some(w);
            break;
        }
    }
    let window = window.expect("xterm window never appeared");

    session.activate_window(&window.handle).await.unwrap();
    assert_eq!(session.active_window().await.unwrap().handle, window.handle);
    let geometry = session.window_geometry(&window.handle).await.unwrap();
    assert!(geometry.width > 0 && geometry.height > 0);
    session.close_window(&window.handle).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let windows = session.list_windows(None).await.unwrap();
    assert!(windows.iter().all(|w| w.handle != window.handle));

    session.close().await;
}
