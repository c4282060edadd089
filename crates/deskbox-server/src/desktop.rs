//! Desktop actions driven through X11 command-line tools.
//!
//! Input goes through `xdotool`, screenshots through `scrot`, and the screen
//! size comes from configuration or `xrandr`. Every tool runs with the
//! configured `DISPLAY`.

use crate::config::Dimensions;
use crate::exec::{run_process, spawn_detached};
use crate::input;
use crate::protocol::{error_codes, ExecResult, MouseButton, RpcFailure, ScrollDirection};
use serde::Serialize;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Upper bound for a single desktop tool invocation.
const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest per-character typing delay accepted.
pub const MAX_TYPE_DELAY_MS: u64 = 10_000;

/// Budget for one `xdotool type` run: the typing time plus the tool timeout.
pub fn type_chunk_timeout(chars: usize, delay_ms: u64) -> Duration {
    let typing_ms = delay_ms.saturating_mul(u64::try_from(chars).unwrap_or(u64::MAX));
    TOOL_TIMEOUT.saturating_add(Duration::from_millis(typing_ms))
}

/// Host facts for the `platform` method.
#[derive(Debug, Serialize)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
    pub hostname: String,
}

/// Handle to the X display inside the container.
pub struct Desktop {
    display: String,
    configured: Option<Dimensions>,
    probed: OnceCell<Dimensions>,
}

impl Desktop {
    pub fn new(display: impl Into<String>, screen_size: Option<Dimensions>) -> Self {
        Self {
            display: display.into(),
            configured: screen_size,
            probed: OnceCell::new(),
        }
    }

    /// A command with `DISPLAY` set.
    pub fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.env("DISPLAY", &self.display);
        cmd
    }

    /// Run a tool and return its raw result.
    pub(crate) async fn run_tool(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<ExecResult, RpcFailure> {
        self.run_tool_with_timeout(program, args, TOOL_TIMEOUT).await
    }

    async fn run_tool_with_timeout(
        &self,
        program: &str,
        args: &[String],
        limit: Duration,
    ) -> Result<ExecResult, RpcFailure> {
        debug!(program, args = ?args, timeout_ms = limit.as_millis() as u64, "running desktop tool");
        let mut cmd = self.command(program);
        cmd.args(args);
        let result = run_process(cmd, limit)
            .await
            .map_err(|e| RpcFailure::action_failed(format!("failed to run {program}: {e}")))?;
        if result.timed_out {
            return Err(RpcFailure::action_failed(format!("{program} timed out")));
        }
        Ok(result)
    }

    /// Run a tool that must succeed, returning its stdout.
    pub(crate) async fn tool(&self, program: &str, args: &[String]) -> Result<String, RpcFailure> {
        self.tool_with_timeout(program, args, TOOL_TIMEOUT).await
    }

    async fn tool_with_timeout(
        &self,
        program: &str,
        args: &[String],
        limit: Duration,
    ) -> Result<String, RpcFailure> {
        let result = self.run_tool_with_timeout(program, args, limit).await?;
        if result.exit_code != Some(0) {
            return Err(RpcFailure::action_failed(format!(
                "{program} failed ({:?}): {}",
                result.exit_code,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&result.stdout).into_owned())
    }

    async fn xdotool(&self, args: Vec<String>) -> Result<String, RpcFailure> {
        self.tool("xdotool", &args).await
    }

    /// Screen dimensions, from configuration or probed once via `xrandr`.
    pub async fn screen_size(&self) -> Result<Dimensions, RpcFailure> {
        if let Some(size) = self.configured {
            return Ok(size);
        }
        self.probed
            .get_or_try_init(|| async {
                let output = self.tool("xrandr", &[]).await?;
                let (width, height) = input::parse_xrandr_current(&output).ok_or_else(|| {
                    RpcFailure::action_failed("could not parse screen size from xrandr")
                })?;
                Ok::<_, RpcFailure>(Dimensions { width, height })
            })
            .await
            .copied()
    }

    /// Reject coordinates outside the screen.
    pub async fn check_point(&self, x: i64, y: i64) -> Result<(), RpcFailure> {
        let size = self.screen_size().await?;
        if size.contains(x, y) {
            Ok(())
        } else {
            Err(RpcFailure::new(
                error_codes::OUT_OF_BOUNDS,
                format!("({x}, {y}) is outside the {size} screen"),
            ))
        }
    }

    pub async fn move_to(&self, x: i64, y: i64) -> Result<(), RpcFailure> {
        self.check_point(x, y).await?;
        self.xdotool(input::move_args(x, y)).await.map(drop)
    }

    async fn move_if(&self, x: Option<i64>, y: Option<i64>) -> Result<(), RpcFailure> {
        match (x, y) {
            (Some(x), Some(y)) => self.move_to(x, y).await,
            (None, None) => Ok(()),
            _ => Err(RpcFailure::invalid_params("x and y must be given together")),
        }
    }

    /// Click at a point, or at the cursor when no point is given.
    pub async fn click(
        &self,
        x: Option<i64>,
        y: Option<i64>,
        button: MouseButton,
        count: u32,
    ) -> Result<(), RpcFailure> {
        self.move_if(x, y).await?;
        self.xdotool(input::click_args(button, count)).await.map(drop)
    }

    pub async fn mouse_button(&self, button: MouseButton, press: bool) -> Result<(), RpcFailure> {
        self.xdotool(input::button_args(button, press)).await.map(drop)
    }

    /// Press at `from`, move to `to`, release.
    pub async fn drag(&self, from: (i64, i64), to: (i64, i64)) -> Result<(), RpcFailure> {
        self.check_point(to.0, to.1).await?;
        self.move_to(from.0, from.1).await?;
        self.mouse_button(MouseButton::Left, true).await?;
        let moved = self.move_to(to.0, to.1).await;
        // Always release, even if the move failed.
        let released = self.mouse_button(MouseButton::Left, false).await;
        moved.and(released)
    }

    pub async fn scroll(
        &self,
        x: Option<i64>,
        y: Option<i64>,
        direction: ScrollDirection,
        amount: u32,
    ) -> Result<(), RpcFailure> {
        self.move_if(x, y).await?;
        self.xdotool(input::scroll_args(direction, amount))
            .await
            .map(drop)
    }

    pub async fn key_press(&self, keys: &[String]) -> Result<(), RpcFailure> {
        self.xdotool(input::key_args(keys)?).await.map(drop)
    }

    /// Type text in chunks; each chunk gets time for its own typing delay.
    pub async fn type_text(&self, text: &str, delay_ms: u64) -> Result<(), RpcFailure> {
        if delay_ms > MAX_TYPE_DELAY_MS {
            return Err(RpcFailure::invalid_params(format!(
                "delay_ms must be at most {MAX_TYPE_DELAY_MS}"
            )));
        }
        for args in input::type_args(text, delay_ms) {
            let chars = args.last().map_or(0, |chunk| chunk.chars().count());
            self.tool_with_timeout("xdotool", &args, type_chunk_timeout(chars, delay_ms))
                .await?;
        }
        Ok(())
    }

    pub async fn cursor_position(&self) -> Result<(i64, i64), RpcFailure> {
        let output = self
            .xdotool(vec!["getmouselocation".to_string()])
            .await?;
        input::parse_mouse_location(&output)
            .ok_or_else(|| RpcFailure::action_failed("could not parse cursor position"))
    }

    /// Capture the screen as PNG bytes.
    pub async fn screenshot(&self) -> Result<Vec<u8>, RpcFailure> {
        let path = std::env::temp_dir().join(format!("deskbox-shot-{}.png", uuid::Uuid::new_v4()));
        let path_arg = path.to_string_lossy().into_owned();
        self.tool("scrot", &["--overwrite".to_string(), path_arg])
            .await?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| RpcFailure::action_failed(format!("failed to read screenshot: {e}")));
        let _ = tokio::fs::remove_file(&path).await;
        data
    }

    /// Start a shell command on the desktop without waiting for it.
    pub fn launch(&self, command: &str) -> Result<u32, RpcFailure> {
        if command.trim().is_empty() {
            return Err(RpcFailure::invalid_params("command must be non-empty"));
        }
        let mut cmd = self.command("sh");
        cmd.args(["-c", command]);
        let pid = spawn_detached(cmd)
            .map_err(|e| RpcFailure::action_failed(format!("failed to launch: {e}")))?;
        info!(pid, command, "application launched");
        Ok(pid)
    }

    /// Open a URL in the desktop's default browser.
    pub fn open_url(&self, url: &str) -> Result<u32, RpcFailure> {
        if !(url.starts_with("http://") || url.starts_with("https://") || url.starts_with("file://"))
        {
            return Err(RpcFailure::invalid_params(format!("unsupported url: {url}")));
        }
        let mut cmd = self.command("xdg-open");
        cmd.arg(url);
        let pid = spawn_detached(cmd)
            .map_err(|e| RpcFailure::action_failed(format!("failed to open url: {e}")))?;
        info!(pid, url, "url opened");
        Ok(pid)
    }

    pub fn platform(&self) -> Platform {
        let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
            .or_else(|_| std::fs::read_to_string("/etc/hostname"))
            .map(|h| h.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Platform {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            hostname,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desktop() -> Desktop {
        Desktop::new(
            ":99",
            Some(Dimensions {
                width: 800,
                height: 600,
            }),
        )
    }

    #[tokio::test]
    async fn test_configured_screen_size() {
        let size = desktop().screen_size().await.unwrap();
        assert_eq!(size.width, 800);
        assert_eq!(size.height, 600);
    }

    #[tokio::test]
    async fn test_out_of_bounds_rejected_before_any_tool_runs() {
        let err = desktop().move_to(800, 10).await.unwrap_err();
        assert_eq!(err.code, error_codes::OUT_OF_BOUNDS);
        let err = desktop().drag((10, 10), (-5, 10)).await.unwrap_err();
        assert_eq!(err.code, error_codes::OUT_OF_BOUNDS);
    }

    #[tokio::test]
    async fn test_partial_point_is_invalid() {
        let err = desktop()
            .click(Some(1), None, MouseButton::Left, 1)
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_missing_tool_is_action_failure() {
        let err = desktop()
            .tool("deskbox-no-such-tool", &[])
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::ACTION_FAILED);
    }

    #[tokio::test]
    async fn test_tool_sees_display() {
        let out = desktop()
            .tool("sh", &["-c".to_string(), "printf %s \"$DISPLAY\"".to_string()])
            .await
            .unwrap();
        assert_eq!(out, ":99");
    }

    #[test]
    fn test_type_chunk_timeout_covers_slow_typing() {
        // 25 chars at 1.3 s each need 32.5 s of typing alone.
        let limit = type_chunk_timeout(input::TYPE_CHUNK_CHARS, 1300);
        assert!(limit >= Duration::from_millis(32_500) + TOOL_TIMEOUT);
        assert_eq!(type_chunk_timeout(0, 1300), TOOL_TIMEOUT);
        // Saturates instead of overflowing.
        let huge = type_chunk_timeout(usize::MAX, u64::MAX);
        assert!(huge >= Duration::from_millis(u64::MAX));
    }

    #[tokio::test]
    async fn test_tool_timeout_is_per_call() {
        let args = ["-c".to_string(), "sleep 2".to_string()];
        let err = desktop()
            .tool_with_timeout("sh", &args, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::ACTION_FAILED);
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_type_delay_limit() {
        let err = desktop()
            .type_text("abc", MAX_TYPE_DELAY_MS + 1)
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_PARAMS);
    }

    #[test]
    fn test_open_url_rejects_other_schemes() {
        let err = desktop().open_url("javascript:alert(1)").unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_PARAMS);
    }

    #[test]
    fn test_platform() {
        let platform = desktop().platform();
        assert_eq!(platform.os, std::env::consts::OS);
        assert!(!platform.hostname.is_empty());
    }
}
