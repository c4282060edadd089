//! # deskbox-server
//!
//! In-container control server for deskbox desktop sessions.
//!
//! Listens on TCP and handles newline-delimited JSON-RPC requests for input
//! injection, window management, screenshots, recording, command execution
//! and file transfer. Desktop actions are carried out with the X11 tools
//! installed in the desktop image (`xdotool`, `wmctrl`, `scrot`, `xrandr`,
//! `ffmpeg`).
//!
//! ## Running in-process
//!
//! ```no_run
//! use deskbox_server::{Server, ServerConfig};
//!
//! # async fn example() -> deskbox_server::Result<()> {
//! let config = ServerConfig {
//!     listen: "127.0.0.1:0".parse().unwrap(),
//!     ..ServerConfig::default()
//! };
//! let server = Server::bind(config).await?;
//! println!("listening on {}", server.local_addr()?);
//! server.run(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod desktop;
mod error;
mod exec;
mod handler;
mod input;
pub mod protocol;
mod recording;
mod server;
mod transfer;
mod window;

pub use config::{ConfigError, Dimensions, ServerConfig};
pub use error::{Result, ServerError};
pub use handler::Handler;
pub use recording::{RecordingArtifact, RecordingInfo};
pub use server::{Server, SERVER_VERSION};
