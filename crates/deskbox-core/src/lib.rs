//! # deskbox-core
//!
//! Session client for deskbox containerized desktops.
//!
//! A [`Session`] owns one desktop container, waits for its control server to
//! come up, and turns method calls into control-channel requests.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    deskbox-core (host)                   │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │    Session      │────▶│  dyn Provider            │   │
//! │  │  - open()       │     │  (deskbox-provider)      │   │
//! │  │  - click()      │     │  provision / terminate   │   │
//! │  │  - upload()     │     └──────────────────────────┘   │
//! │  │  - close()      │                                    │
//! │  └─────────────────┘                                    │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │ ControlClient   │────▶│  TCP, AUTH handshake,    │   │
//! │  │  - call()       │     │  JSON-RPC per line       │   │
//! │  │  - ping()       │     └──────────────────────────┘   │
//! │  └─────────────────┘                                    │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │             deskbox-server (in container)                │
//! │                Listening on port 5000                    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use deskbox_core::{MouseButton, Session, SessionConfig};
//!
//! # async fn example() -> deskbox_core::Result<()> {
//! let config = SessionConfig::builder()
//!     .screen_size("1280x720".parse().unwrap())
//!     .build()?;
//! let session = Session::open(config).await?;
//!
//! let result = session.execute_command("echo hello").await?;
//! assert_eq!(result.stdout, b"hello\n");
//!
//! session.launch("xterm").await?;
//! session.click(100, 100, MouseButton::Left).await?;
//! let png = session.screenshot().await?;
//! println!("screenshot: {} bytes", png.len());
//!
//! session.upload("report.csv", "~/report.csv").await?;
//!
//! // Cleanup (safe to repeat)
//! session.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Session Lifecycle**: Provision, readiness polling with backoff, idempotent close
//! - **Desktop Input**: Mouse, keyboard and window management
//! - **Command Execution**: Shell and Python with timeouts and partial output
//! - **Recording**: Capture the display and download the video
//! - **File Transfer**: Chunked upload/download with no partial results
//! - **Automatic Retry**: One reconnect-and-retry for transport failures where safe

mod actions;
mod backoff;
mod client;
mod config;
mod error;
mod session;
mod transfer;

pub use actions::{MouseButton, ScrollDirection, DEFAULT_TYPING_DELAY, MAX_TYPING_DELAY};
pub use client::{
    CommandResult, ControlClient, DesktopPath, DirNode, FileEntry, Platform, RecordingArtifact,
    RecordingInfo, Window, WindowGeometry, WindowHandle,
};
pub use config::{OsType, ProviderType, SessionConfig, SessionConfigBuilder, MAX_TIMEOUT};
pub use error::{ErrorKind, Result, SessionError};
pub use session::{Session, SessionState};
pub use transfer::CHUNK_SIZE;

pub use deskbox_provider::{ContainerHandle, Provider, ScreenSize, VolumeSpec};
