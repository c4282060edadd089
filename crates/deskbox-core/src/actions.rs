//! Desktop actions, command execution and recording on a [`Session`].
//!
//! Each method maps to exactly one control server call.

use crate::client::{
    CommandResult, Platform, RecordingInfo, Window, WindowGeometry, WindowHandle,
};
use crate::config::check_max_timeout;
use crate::error::{Result, SessionError};
use crate::session::Session;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use deskbox_provider::ScreenSize;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// Default per-character delay for [`Session::type_text`].
pub const DEFAULT_TYPING_DELAY: Duration = Duration::from_millis(75);

/// Longest accepted delay between typed characters.
pub const MAX_TYPING_DELAY: Duration = Duration::from_secs(10);

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
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Deserialize)]
struct Point {
    x: i64,
    y: i64,
}

#[derive(Deserialize)]
struct Size {
    width: u32,
    height: u32,
}

#[derive(Deserialize)]
struct Spawned {
    pid: u32,
}

#[derive(Deserialize)]
struct WindowList {
    windows: Vec<Window>,
}

#[derive(Deserialize)]
struct Screenshot {
    data: String,
}

/// Response budget for typing `chars` characters: the server types for
/// about `chars * delay`.
fn typing_budget(rpc_timeout: Duration, delay: Duration, chars: usize) -> Duration {
    let chars = u32::try_from(chars).unwrap_or(u32::MAX);
    rpc_timeout.saturating_add(delay.saturating_mul(chars))
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(SessionError::from)
}

impl Session {
    async fn action(&self, method: &str, params: Value) -> Result<Value> {
        tracing::debug!(session_id = %self.id(), method = %method, "Desktop action");
        self.call(method, params, self.config().rpc_timeout).await
    }

    /// Click at a position.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the point is outside the screen.
    pub async fn click(&self, x: i64, y: i64, button: MouseButton) -> Result<()> {
        self.action("click", json!({"x": x, "y": y, "button": button, "count": 1}))
            .await?;
        Ok(())
    }

    /// Double-click with the left button.
    pub async fn double_click(&self, x: i64, y: i64) -> Result<()> {
        self.action(
            "click",
            json!({"x": x, "y": y, "button": MouseButton::Left, "count": 2}),
        )
        .await?;
        Ok(())
    }

    /// Click with the right button.
    pub async fn right_click(&self, x: i64, y: i64) -> Result<()> {
        self.click(x, y, MouseButton::Right).await
    }

    /// Move the pointer.
    pub async fn move_mouse(&self, x: i64, y: i64) -> Result<()> {
        self.action("move", json!({"x": x, "y": y})).await?;
        Ok(())
    }

    /// Press and hold a mouse button at the current position.
    pub async fn mouse_press(&self, button: MouseButton) -> Result<()> {
        self.action("mouse_press", json!({"button": button})).await?;
        Ok(())
    }

    /// Release a held mouse button.
    pub async fn mouse_release(&self, button: MouseButton) -> Result<()> {
        self.action("mouse_release", json!({"button": button}))
            .await?;
        Ok(())
    }

    /// Drag with the left button from one point to another.
    pub async fn drag(&self, from: (i64, i64), to: (i64, i64)) -> Result<()> {
        self.action("drag", json!({"from": from, "to": to})).await?;
        Ok(())
    }

    /// Scroll `amount` steps at a position.
    pub async fn scroll(
        &self,
        x: i64,
        y: i64,
        direction: ScrollDirection,
        amount: u32,
    ) -> Result<()> {
        self.action(
            "scroll",
            json!({"x": x, "y": y, "direction": direction, "amount": amount}),
        )
        .await?;
        Ok(())
    }

    /// Press a key combination, e.g. `["ctrl", "c"]`.
    ///
    /// Keys are pressed in order and released together.
    pub async fn key_press(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Err(SessionError::InvalidArgument("no keys given".into()));
        }
        self.action("key_press", json!({"keys": keys})).await?;
        Ok(())
    }

    /// Type text with a delay between characters.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `delay` exceeds [`MAX_TYPING_DELAY`].
    pub async fn type_text(&self, text: &str, delay: Duration) -> Result<()> {
        if delay > MAX_TYPING_DELAY {
            return Err(SessionError::InvalidArgument(format!(
                "typing delay must be at most {} ms, got {} ms",
                MAX_TYPING_DELAY.as_millis(),
                delay.as_millis()
            )));
        }
        let budget = typing_budget(self.config().rpc_timeout, delay, text.chars().count());
        self.call(
            "type_text",
            json!({"text": text, "delay_ms": delay.as_millis() as u64}),
            budget,
        )
        .await?;
        Ok(())
    }

    /// Start a shell command on the desktop without waiting for it.
    ///
    /// Returns the process id inside the container.
    pub async fn launch(&self, command: &str) -> Result<u32> {
        let spawned: Spawned = decode(self.action("launch", json!({"command": command})).await?)?;
        tracing::info!(session_id = %self.id(), pid = spawned.pid, command = %command, "Application launched");
        Ok(spawned.pid)
    }

    /// Open a URL in the desktop browser.
    pub async fn open_url(&self, url: &str) -> Result<u32> {
        let spawned: Spawned = decode(self.action("open_url", json!({"url": url})).await?)?;
        Ok(spawned.pid)
    }

    /// List visible windows, optionally filtered by application class.
    pub async fn list_windows(&self, app_hint: Option<&str>) -> Result<Vec<Window>> {
        let list: WindowList =
            decode(self.action("list_windows", json!({"app_hint": app_hint})).await?)?;
        tracing::trace!(session_id = %self.id(), count = list.windows.len(), "Windows listed");
        Ok(list.windows)
    }

    /// Raise and focus a window.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the window no longer exists.
    pub async fn activate_window(&self, handle: &WindowHandle) -> Result<()> {
        self.action("activate_window", json!({"handle": handle}))
            .await?;
        Ok(())
    }

    /// The window that currently has keyboard focus.
    pub async fn active_window(&self) -> Result<Window> {
        decode(self.action("active_window", json!({})).await?)
    }

    /// Position and size of a window.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the window no longer exists.
    pub async fn window_geometry(&self, handle: &WindowHandle) -> Result<WindowGeometry> {
        decode(self.action("window_geometry", json!({"handle": handle})).await?)
    }

    /// Ask a window to close.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the window no longer exists.
    pub async fn close_window(&self, handle: &WindowHandle) -> Result<()> {
        self.action("close_window", json!({"handle": handle})).await?;
        Ok(())
    }

    /// Capture the screen as PNG bytes.
    pub async fn screenshot(&self) -> Result<Vec<u8>> {
        let shot: Screenshot = decode(self.action("screenshot", json!({})).await?)?;
        STANDARD
            .decode(shot.data)
            .map_err(|e| SessionError::Transport(format!("screenshot payload: {e}")))
    }

    /// Current pointer position.
    pub async fn cursor_position(&self) -> Result<(i64, i64)> {
        let point: Point = decode(self.action("cursor_position", json!({})).await?)?;
        Ok((point.x, point.y))
    }

    /// Display geometry as seen by the server.
    pub async fn screen_size(&self) -> Result<ScreenSize> {
        let size: Size = decode(self.action("screen_size", json!({})).await?)?;
        Ok(ScreenSize::new(size.width, size.height))
    }

    /// Operating system facts from inside the container.
    pub async fn platform(&self) -> Result<Platform> {
        decode(self.action("platform", json!({})).await?)
    }

    /// Execute a shell command with the configured timeout.
    ///
    /// A command that runs out of time is not an error: the result has
    /// `timed_out` set and carries the output produced so far. Use
    /// [`CommandResult::ensure_completed`] to treat it as one.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if another command is running on this session.
    pub async fn execute_command(&self, command: &str) -> Result<CommandResult> {
        self.execute_command_with_timeout(command, self.config().command_timeout)
            .await
    }

    /// Execute a shell command with an explicit timeout.
    pub async fn execute_command_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult> {
        self.run_command(command, "shell", &[], timeout).await
    }

    /// Execute Python code after importing `modules`.
    ///
    /// A module that fails to import shows up in `stderr` with a non-zero
    /// exit code.
    pub async fn execute_python_command(
        &self,
        code: &str,
        modules: &[&str],
    ) -> Result<CommandResult> {
        self.run_command(code, "python", modules, self.config().command_timeout)
            .await
    }

    async fn run_command(
        &self,
        command: &str,
        interpreter: &str,
        modules: &[&str],
        timeout: Duration,
    ) -> Result<CommandResult> {
        if timeout.is_zero() {
            return Err(SessionError::InvalidArgument("timeout must be > 0".into()));
        }
        check_max_timeout("timeout", timeout)?;
        let _slot = self.claim_command_slot()?;
        tracing::debug!(
            session_id = %self.id(),
            interpreter,
            command_len = command.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Executing command"
        );
        let params = json!({
            "command": command,
            "interpreter": interpreter,
            "modules": modules,
            "timeout_ms": timeout.as_millis() as u64,
        });
        let value = self
            .call(
                "run_command",
                params,
                timeout.saturating_add(self.config().rpc_timeout),
            )
            .await?;
        let result: CommandResult = decode(value)?;
        tracing::debug!(
            session_id = %self.id(),
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            stdout_len = result.stdout.len(),
            stderr_len = result.stderr.len(),
            "Command completed"
        );
        Ok(result)
    }

    /// Start recording the display.
    ///
    /// # Errors
    ///
    /// Fails if a recording is already active; the active one is untouched.
    pub async fn start_recording(&self) -> Result<RecordingInfo> {
        let info: RecordingInfo = decode(self.action("start_recording", json!({})).await?)?;
        *self.recording_guard() = Some(info.recording_id.clone());
        tracing::info!(session_id = %self.id(), recording_id = %info.recording_id, "Recording started");
        Ok(info)
    }
}
