//! Runtime configuration for deskbox-server.
//!
//! Everything is read from the environment the container was started with.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default listen address inside the container.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:5000";

/// Default X display.
pub const DEFAULT_DISPLAY: &str = ":0";

/// Default directory for finished recordings.
pub const DEFAULT_RECORDING_DIR: &str = "/tmp/deskbox-recordings";

/// Default command timeout when a request does not carry one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors raised while reading the environment.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Screen dimensions the desktop runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    /// Parse `WxH` or `WxHxDEPTH` (the container's `SCREEN_SIZE` format).
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split('x');
        let width = parts.next()?.parse().ok()?;
        let height = parts.next()?.parse().ok()?;
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self { width, height })
    }

    /// Whether a point lies on the screen.
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < i64::from(self.width) && y < i64::from(self.height)
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the control server listens on.
    pub listen: SocketAddr,
    /// Token clients must present in the handshake. `None` accepts any token.
    pub session_token: Option<String>,
    /// Fixed screen size; probed with xrandr when absent.
    pub screen_size: Option<Dimensions>,
    /// X display the desktop tools target.
    pub display: String,
    /// Directory recordings are written to.
    pub recording_dir: PathBuf,
    /// Recorder argv. `{output}`, `{size}` and `{display}` are substituted.
    pub recording_command: Vec<String>,
    /// Timeout applied when `run_command` carries none.
    pub command_timeout: Duration,
    /// Python interpreter for `interpreter = python`.
    pub python: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5000)),
            session_token: None,
            screen_size: None,
            display: DEFAULT_DISPLAY.to_string(),
            recording_dir: PathBuf::from(DEFAULT_RECORDING_DIR),
            recording_command: default_recording_command(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            python: "python3".to_string(),
        }
    }
}

impl ServerConfig {
    /// Build a configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `DESKBOX_LISTEN` | `0.0.0.0:5000` |
    /// | `DESKBOX_SESSION_TOKEN` / `SESSION_PASSWORD` | none |
    /// | `SCREEN_SIZE` | probed |
    /// | `DISPLAY` | `:0` |
    /// | `DESKBOX_RECORDING_DIR` | `/tmp/deskbox-recordings` |
    /// | `DESKBOX_COMMAND_TIMEOUT_SECS` | `120` |
    /// | `DESKBOX_PYTHON` | `python3` |
    ///
    /// # Errors
    /// Returns an error if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let listen = lookup("DESKBOX_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        config.listen = listen.parse().map_err(|_| ConfigError::Invalid {
            name: "DESKBOX_LISTEN",
            value: listen.clone(),
        })?;

        config.session_token = lookup("DESKBOX_SESSION_TOKEN")
            .or_else(|| lookup("SESSION_PASSWORD"))
            .filter(|t| !t.is_empty());

        if let Some(size) = lookup("SCREEN_SIZE") {
            config.screen_size = Some(Dimensions::parse(&size).ok_or(ConfigError::Invalid {
                name: "SCREEN_SIZE",
                value: size.clone(),
            })?);
        }

        if let Some(display) = lookup("DISPLAY").filter(|d| !d.is_empty()) {
            config.display = display;
        }

        if let Some(dir) = lookup("DESKBOX_RECORDING_DIR") {
            config.recording_dir = PathBuf::from(dir);
        }

        if let Some(secs) = lookup("DESKBOX_COMMAND_TIMEOUT_SECS") {
            let parsed: u64 = secs.parse().map_err(|_| ConfigError::Invalid {
                name: "DESKBOX_COMMAND_TIMEOUT_SECS",
                value: secs.clone(),
            })?;
            config.command_timeout = Duration::from_secs(parsed);
        }

        if let Some(python) = lookup("DESKBOX_PYTHON") {
            config.python = python;
        }

        Ok(config)
    }
}

/// ffmpeg x11grab at 30 fps, H.264.
fn default_recording_command() -> Vec<String> {
    [
        "ffmpeg", "-y", "-f", "x11grab", "-draw_mouse", "1", "-s", "{size}", "-i", "{display}",
        "-c:v", "libx264", "-r", "30", "{output}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
