//! # deskbox-provider
//!
//! Container lifecycle layer for deskbox desktop sessions.
//! Provides a small [`Provider`] abstraction and a Docker implementation.
//!
//! ## Quick Start
//!
//! ```no_run
//! use deskbox_provider::{DockerProvider, Provider, ProvisionBuilder};
//!
//! # async fn example() -> deskbox_provider::Result<()> {
//! let provider = DockerProvider::connect()?;
//!
//! // Create and start a desktop container
//! let handle = ProvisionBuilder::new().provision(&provider).await?;
//! println!("control server reachable: {}", provider.health_check(&handle).await);
//!
//! // Cleanup (safe to repeat)
//! provider.terminate(&handle).await?;
//! provider.terminate(&handle).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Lifecycle Management**: Provision, probe, and terminate containers
//! - **Port Publishing**: Control, display, and browser ports on ephemeral host ports
//! - **Volume Mounting**: Ordered `host:container[:ro]` bind mounts
//! - **Builder Pattern**: Ergonomic configuration with `ProvisionBuilder`

mod builder;
mod config;
mod docker;
mod error;
mod provider;

pub use builder::ProvisionBuilder;
pub use config::{
    validate_volumes, ProvisionConfig, ScreenSize, VolumeSpec, BROWSER_PORT, CONTROL_PORT,
    DEFAULT_IMAGE, DEFAULT_SHM_SIZE, DISPLAY_PORT,
};
pub use docker::{DockerProvider, SESSION_LABEL};
pub use error::{ProviderError, Result};
pub use provider::{probe_endpoint, ContainerHandle, Provider, PROBE_TIMEOUT};
