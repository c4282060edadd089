//! Window enumeration and control.
//!
//! Handles are X window ids rendered in decimal. A handle is only checked
//! against the live window tree; a closed window's id is never rebound.

use crate::desktop::Desktop;
use crate::input;
use crate::protocol::{RpcFailure, WindowGeometry, WindowInfo};
use tracing::debug;

/// Parse a handle in decimal or `0x` hex form.
pub fn parse_handle(handle: &str) -> Option<u64> {
    let handle = handle.trim();
    let id = match handle.strip_prefix("0x").or_else(|| handle.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => handle.parse().ok()?,
    };
    (id != 0).then_some(id)
}

impl Desktop {
    /// Visible windows, optionally filtered by window class.
    pub async fn list_windows(&self, app_hint: Option<&str>) -> Result<Vec<WindowInfo>, RpcFailure> {
        let mut args = vec!["search".to_string(), "--onlyvisible".to_string()];
        match app_hint.filter(|h| !h.trim().is_empty()) {
            Some(hint) => args.extend(["--class".to_string(), hint.to_string()]),
            None => args.extend(["--name".to_string(), ".".to_string()]),
        }

        let result = self.run_tool("xdotool", &args).await?;
        let ids = String::from_utf8_lossy(&result.stdout);
        // xdotool exits 1 when nothing matches.
        if result.exit_code != Some(0) && ids.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut windows = Vec::new();
        for id in ids.lines().filter_map(parse_handle) {
            // Windows can vanish between search and lookup.
            if let Ok(title) = self.window_title(id).await {
                windows.push(WindowInfo {
                    handle: id.to_string(),
                    title,
                });
            }
        }
        debug!(count = windows.len(), app_hint = ?app_hint, "listed windows");
        Ok(windows)
    }

    async fn window_title(&self, id: u64) -> Result<String, RpcFailure> {
        let title = self
            .tool("xdotool", &["getwindowname".to_string(), id.to_string()])
            .await?;
        Ok(title.trim_end_matches('\n').to_string())
    }

    /// Resolve a handle to a live window id.
    async fn live_window(&self, handle: &str) -> Result<u64, RpcFailure> {
        let id = parse_handle(handle).ok_or_else(|| RpcFailure::invalid_handle(handle))?;
        self.window_title(id)
            .await
            .map_err(|_| RpcFailure::invalid_handle(handle))?;
        Ok(id)
    }

    pub async fn activate_window(&self, handle: &str) -> Result<(), RpcFailure> {
        let id = self.live_window(handle).await?;
        self.tool("wmctrl", &["-i".to_string(), "-a".to_string(), format!("0x{id:08x}")])
            .await
            .map(drop)
    }

    /// The window holding keyboard focus.
    pub async fn active_window(&self) -> Result<WindowInfo, RpcFailure> {
        let output = self.tool("xdotool", &["getwindowfocus".to_string()]).await?;
        let id = parse_handle(&output)
            .ok_or_else(|| RpcFailure::action_failed("no window has focus"))?;
        let title = self.window_title(id).await?;
        Ok(WindowInfo {
            handle: id.to_string(),
            title,
        })
    }

    /// Position and size of a window.
    pub async fn window_geometry(&self, handle: &str) -> Result<WindowGeometry, RpcFailure> {
        let id = self.live_window(handle).await?;
        let output = self
            .tool(
                "xdotool",
                &["getwindowgeometry".to_string(), "--shell".to_string(), id.to_string()],
            )
            .await?;
        input::parse_window_geometry(&output)
            .ok_or_else(|| RpcFailure::action_failed("could not parse window geometry"))
    }

    /// Ask the window manager to close a window.
    pub async fn close_window(&self, handle: &str) -> Result<(), RpcFailure> {
        let id = self.live_window(handle).await?;
        self.tool("wmctrl", &["-i".to_string(), "-c".to_string(), format!("0x{id:08x}")])
            .await
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::error_codes;

    #[test]
    fn test_parse_handle() {
        assert_eq!(parse_handle("6291463"), Some(6291463));
        assert_eq!(parse_handle("0x00600007"), Some(0x600007));
        assert_eq!(parse_handle(" 42\n"), Some(42));
        assert_eq!(parse_handle("0"), None);
        assert_eq!(parse_handle("firefox"), None);
        assert_eq!(parse_handle(""), None);
    }

    #[tokio::test]
    async fn test_malformed_handle_is_invalid() {
        let desktop = Desktop::new(":99", None);
        let err = desktop.activate_window("not-a-window").await.unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_HANDLE);
        let err = desktop.close_window("").await.unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_HANDLE);
        let err = desktop.window_geometry("0x0").await.unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_HANDLE);
    }
}
