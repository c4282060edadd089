//! Session type - one provisioned desktop container and its control channel.

use crate::backoff::Backoff;
use crate::client::{CallError, ControlClient};
use crate::config::{SessionConfig, MAX_TIMEOUT};
use crate::error::{Result, SessionError};
use chrono::{DateTime, Utc};
use deskbox_provider::{ContainerHandle, DockerProvider, Provider};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

/// Upper bound for a single readiness probe.
const PROBE_LIMIT: Duration = Duration::from_secs(10);

/// Lifecycle state of a session.
///
/// States only move forward: `Provisioning → Starting → Ready → Closing →
/// Closed`, with `Failed` reached when startup gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// The container is being created.
    Provisioning,
    /// Waiting for the control server to answer.
    Starting,
    /// Accepting calls.
    Ready,
    /// Teardown in progress.
    Closing,
    /// The container has been released.
    Closed,
    /// Startup failed and the container was released.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Starting => write!(f, "Starting"),
            Self::Ready => write!(f, "Ready"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Methods that can be re-sent after a lost response without repeating a
/// visible effect.
pub(crate) fn is_idempotent(method: &str) -> bool {
    matches!(
        method,
        "ping"
            | "platform"
            | "screen_size"
            | "cursor_position"
            | "move"
            | "screenshot"
            | "pull_file"
            | "list_windows"
            | "list_dir"
            | "activate_window"
            | "active_window"
            | "window_geometry"
            | "desktop_path"
            | "directory_tree"
            | "abort_push"
    )
}

/// A live desktop session.
///
/// A session owns exactly one container for its whole lifetime. Calls are
/// sent one at a time over a single control connection, in the order they
/// are made. Call [`close`](Self::close) when done; dropping an open session
/// only makes a best-effort attempt to release the container.
pub struct Session {
    id: String,
    config: SessionConfig,
    provider: Arc<dyn Provider>,
    handle: ContainerHandle,
    state: Mutex<SessionState>,
    conn: tokio::sync::Mutex<Option<ControlClient>>,
    command_running: AtomicBool,
    recording: Mutex<Option<String>>,
    created_at: DateTime<Utc>,
}

/// Releases the per-session command slot when dropped.
pub(crate) struct CommandSlot<'a>(&'a AtomicBool);

impl Drop for CommandSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Session {
    /// Open a session on the local Docker daemon.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if the configuration is invalid
    /// - `Provision` if the container cannot be created
    /// - `SessionStart` if the control server is not ready within
    ///   `startup_timeout`; the container has already been removed
    pub async fn open(config: SessionConfig) -> Result<Self> {
        let provider = DockerProvider::connect()?;
        Self::open_with(Arc::new(provider), config).await
    }

    /// Open a session using the given provider.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub async fn open_with(provider: Arc<dyn Provider>, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let provision = config.provision_config();
        let start = std::time::Instant::now();
        tracing::info!(
            session_id = %provision.session_id,
            provider = provider.name(),
            image = %config.image,
            screen_size = %config.screen_size,
            headless = config.headless,
            state = %SessionState::Provisioning,
            "Opening session"
        );

        let handle = provider.provision(&provision).await.map_err(|e| {
            tracing::error!(session_id = %provision.session_id, error = %e, "Provisioning failed");
            SessionError::from(e)
        })?;
        tracing::debug!(
            session_id = %handle.session_id,
            container_id = %handle.container_id,
            control = %handle.control_endpoint,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Container provisioned"
        );

        let session = Self {
            id: handle.session_id.clone(),
            config,
            provider,
            handle,
            state: Mutex::new(SessionState::Starting),
            conn: tokio::sync::Mutex::new(None),
            command_running: AtomicBool::new(false),
            recording: Mutex::new(None),
            created_at: Utc::now(),
        };

        match session.wait_ready().await {
            Ok(client) => {
                *session.conn.lock().await = Some(client);
                session.set_state(SessionState::Ready);
                tracing::info!(
                    session_id = %session.id,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Session ready"
                );
                Ok(session)
            }
            Err(reason) => {
                tracing::error!(session_id = %session.id, reason = %reason, "Session failed to start");
                if let Err(e) = session.provider.terminate(&session.handle).await {
                    tracing::warn!(session_id = %session.id, error = %e, "Cleanup after failed start failed");
                }
                session.set_state(SessionState::Failed);
                Err(SessionError::SessionStart {
                    timeout: session.config.startup_timeout,
                    reason,
                })
            }
        }
    }

    /// Poll until the control server completes a handshake and ping.
    async fn wait_ready(&self) -> std::result::Result<ControlClient, String> {
        let now = Instant::now();
        let deadline = now
            .checked_add(self.config.startup_timeout)
            .unwrap_or_else(|| now + MAX_TIMEOUT);
        let mut backoff = Backoff::default();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let reason = match timeout(remaining, self.probe()).await {
                Ok(Ok(client)) => {
                    tracing::debug!(session_id = %self.id, attempts, "Readiness probe succeeded");
                    return Ok(client);
                }
                Ok(Err(reason)) => reason,
                Err(_) => "readiness probe timed out".to_string(),
            };
            tracing::trace!(session_id = %self.id, attempts, reason = %reason, "Not ready yet");

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(format!("{reason} (after {attempts} attempts)"));
            }
            sleep(backoff.next_delay().min(remaining)).await;
        }
    }

    async fn probe(&self) -> std::result::Result<ControlClient, String> {
        if !self.provider.health_check(&self.handle).await {
            return Err(format!(
                "control endpoint {} unreachable",
                self.handle.control_endpoint
            ));
        }
        let limit = self.config.rpc_timeout.min(PROBE_LIMIT);
        let mut client = self.connect(limit).await.map_err(|e| e.to_string())?;
        client.ping(limit).await.map_err(|e| e.to_string())?;
        Ok(client)
    }

    async fn connect(&self, limit: Duration) -> Result<ControlClient> {
        ControlClient::connect(self.handle.control_endpoint, &self.handle.session_token, limit)
            .await
    }

    /// Get the session ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the current state.
    pub fn state(&self) -> SessionState {
        *self.state_guard()
    }

    /// Get the creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Get the configuration used to open this session.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The provider's handle for the container.
    pub fn container(&self) -> &ContainerHandle {
        &self.handle
    }

    /// noVNC URL for watching the desktop; `None` when headless.
    pub fn vnc_url(&self) -> Option<String> {
        self.handle.vnc_url()
    }

    /// Remote debugging endpoint of the in-container browser.
    pub fn browser_endpoint(&self) -> Option<String> {
        self.handle.browser_url()
    }

    /// Check that the control server answers a ping.
    pub async fn health(&self) -> bool {
        if self.state() != SessionState::Ready {
            return false;
        }
        let healthy = self
            .call("ping", serde_json::json!({}), self.config.rpc_timeout)
            .await
            .is_ok();
        tracing::trace!(session_id = %self.id, healthy, "Health check completed");
        healthy
    }

    /// Wait on the caller's side without touching the container.
    pub async fn wait(&self, duration: Duration) {
        sleep(duration).await;
    }

    /// Close the session and release its container.
    ///
    /// Waits up to `close_grace` for an in-flight call to settle, stops a
    /// recording started through this session, then terminates the
    /// container. Always leaves the session `Closed`; cleanup failures are
    /// logged. Calling it again, or while another close is running, returns
    /// immediately.
    pub async fn close(&self) {
        {
            let mut state = self.state_guard();
            match *state {
                SessionState::Closing | SessionState::Closed => {
                    tracing::debug!(session_id = %self.id, state = %*state, "Close skipped");
                    return;
                }
                _ => *state = SessionState::Closing,
            }
        }
        let start = std::time::Instant::now();
        tracing::info!(session_id = %self.id, "Closing session");

        match timeout(self.config.close_grace, self.conn.lock()).await {
            Ok(mut conn) => {
                let recording = self.recording_guard().take();
                if let (Some(recording_id), Some(client)) = (recording, conn.as_mut()) {
                    tracing::debug!(session_id = %self.id, recording_id = %recording_id, "Stopping recording before close");
                    let params = serde_json::json!({ "recording_id": recording_id });
                    if let Err(e) = client
                        .try_call("stop_recording", &params, self.config.rpc_timeout)
                        .await
                    {
                        tracing::warn!(session_id = %self.id, error = ?e, "Failed to stop recording");
                    }
                }
                *conn = None;
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %self.id,
                    grace_ms = self.config.close_grace.as_millis() as u64,
                    "In-flight call did not settle, terminating anyway"
                );
            }
        }

        if let Err(e) = self.provider.terminate(&self.handle).await {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to terminate container");
        }
        self.set_state(SessionState::Closed);
        tracing::info!(
            session_id = %self.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Session closed"
        );
    }

    /// Send one call, retrying once on a transport failure where safe.
    ///
    /// A request that never left is always retried. A request whose response
    /// was lost is retried only for idempotent methods. The connection is
    /// discarded after any transport failure and re-established lazily.
    pub(crate) async fn call(&self, method: &str, params: Value, limit: Duration) -> Result<Value> {
        self.ensure_ready()?;
        let mut conn = self.conn.lock().await;
        self.ensure_ready()?;

        let mut retried = false;
        loop {
            let attempt = match conn.take() {
                Some(mut client) => match client.try_call(method, &params, limit).await {
                    Ok(value) => {
                        *conn = Some(client);
                        return Ok(value);
                    }
                    Err(CallError::Remote(e)) => {
                        *conn = Some(client);
                        return Err(e);
                    }
                    Err(e) => e,
                },
                None => match self.connect(self.config.rpc_timeout).await {
                    Ok(client) => {
                        *conn = Some(client);
                        continue;
                    }
                    Err(e) => CallError::Unsent(e.to_string()),
                },
            };

            let retryable = match &attempt {
                CallError::Unsent(_) => true,
                CallError::Lost(_) => is_idempotent(method),
                CallError::Remote(_) => false,
            };
            if retried || !retryable {
                tracing::warn!(session_id = %self.id, method = %method, error = ?attempt, "Transport failure");
                return Err(attempt.into());
            }
            tracing::warn!(session_id = %self.id, method = %method, error = ?attempt, "Transport failure, retrying once");
            retried = true;
            sleep(Backoff::INITIAL).await;
        }
    }

    /// Claim the command slot, or fail with `Busy`.
    pub(crate) fn claim_command_slot(&self) -> Result<CommandSlot<'_>> {
        self.command_running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| SessionError::Busy)?;
        Ok(CommandSlot(&self.command_running))
    }

    pub(crate) fn recording_guard(&self) -> MutexGuard<'_, Option<String>> {
        self.recording.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            state => Err(SessionError::Closed(state)),
        }
    }

    fn state_guard(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state_guard();
        tracing::debug!(session_id = %self.id, from = %*state, to = %next, "State transition");
        *state = next;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("container_id", &self.handle.container_id)
            .field("control_endpoint", &self.handle.control_endpoint)
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let state = *self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if matches!(state, SessionState::Closed | SessionState::Failed) {
            return;
        }
        tracing::warn!(session_id = %self.id, state = %state, "Session dropped without close");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let provider = Arc::clone(&self.provider);
            let handle = self.handle.clone();
            runtime.spawn(async move {
                if let Err(e) = provider.terminate(&handle).await {
                    tracing::warn!(session_id = %handle.session_id, error = %e, "Failed to terminate dropped session");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::Ready.to_string(), "Ready");
        assert_eq!(SessionState::Closing.to_string(), "Closing");
        assert_eq!(SessionState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_idempotent_methods() {
        for method in [
            "ping",
            "screenshot",
            "pull_file",
            "list_windows",
            "move",
            "directory_tree",
            "window_geometry",
        ] {
            assert!(is_idempotent(method), "{method}");
        }
        for method in [
            "run_command",
            "click",
            "type_text",
            "key_press",
            "launch",
            "open_url",
            "push_file",
            "start_recording",
            "stop_recording",
            "fetch_url",
            "close_window",
            "scroll",
            "drag",
        ] {
            assert!(!is_idempotent(method), "{method}");
        }
    }

    #[test]
    fn test_command_slot_released_on_drop() {
        let flag = AtomicBool::new(true);
        let slot = CommandSlot(&flag);
        drop(slot);
        assert!(!flag.load(Ordering::Acquire));
    }
}
