//! Builder pattern for ergonomic ProvisionConfig construction.

use crate::config::{ProvisionConfig, ScreenSize, VolumeSpec};
use crate::error::Result;
use crate::provider::{ContainerHandle, Provider};

/// Fluent builder for configuring and provisioning desktop containers.
///
/// # Example
///
/// ```no_run
/// use deskbox_provider::{DockerProvider, ProvisionBuilder, ScreenSize};
///
/// # async fn example() -> deskbox_provider::Result<()> {
/// let provider = DockerProvider::connect()?;
/// let handle = ProvisionBuilder::new()
///     .screen_size(ScreenSize::new(1280, 720))
///     .headless(false)
///     .provision(&provider)
///     .await?;
/// println!("control server at {}", handle.control_endpoint);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ProvisionBuilder {
    config: ProvisionConfig,
}

impl ProvisionBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific session identifier instead of a random one.
    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.config.session_id = id.into();
        self
    }

    /// Use a specific handshake token instead of a random one.
    pub fn session_token(mut self, token: impl Into<String>) -> Self {
        self.config.session_token = token.into();
        self
    }

    /// Set the image to run.
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.config.image = image.into();
        self
    }

    /// Set the display resolution.
    pub fn screen_size(mut self, size: ScreenSize) -> Self {
        self.config.screen_size = size;
        self
    }

    /// Skip publishing the display port.
    pub fn headless(mut self, headless: bool) -> Self {
        self.config.headless = headless;
        self
    }

    /// Serve the display channel over TLS.
    pub fn auto_ssl(mut self, enabled: bool) -> Self {
        self.config.auto_ssl = enabled;
        self
    }

    /// Add a bind mount.
    pub fn with_volume(mut self, volume: VolumeSpec) -> Self {
        self.config.volumes.push(volume);
        self
    }

    /// Set the shared memory size in bytes.
    pub fn shm_size(mut self, bytes: i64) -> Self {
        self.config.shm_size = bytes;
        self
    }

    /// Add an environment variable for the container.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.environment.insert(key.into(), value.into());
        self
    }

    /// Build and return the configuration without provisioning anything.
    ///
    /// Useful for testing or inspecting the configuration.
    pub fn build_config(self) -> ProvisionConfig {
        self.config
    }

    /// Validate the configuration and provision a container with it.
    ///
    /// # Errors
    /// Returns an error if validation or provisioning fails.
    pub async fn provision(self, provider: &dyn Provider) -> Result<ContainerHandle> {
        self.config.validate()?;
        provider.provision(&self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProvisionBuilder::new().build_config();
        assert!(config.headless);
        assert!(!config.auto_ssl);
        assert_eq!(config.screen_size, ScreenSize::new(1920, 1080));
        assert!(config.volumes.is_empty());
        assert!(!config.session_id.is_empty());
        assert!(!config.session_token.is_empty());
    }

    #[test]
    fn test_builder_fields() {
        let config = ProvisionBuilder::new()
            .session_id("abc")
            .image("example/desktop:1")
            .screen_size(ScreenSize::new(800, 600))
            .headless(false)
            .auto_ssl(true)
            .with_volume("/tmp:/mnt/tmp".parse().unwrap())
            .env("TZ", "UTC")
            .build_config();

        assert_eq!(config.session_id, "abc");
        assert_eq!(config.image, "example/desktop:1");
        assert_eq!(config.screen_size.to_string(), "800x600");
        assert!(!config.headless);
        assert!(config.auto_ssl);
        assert_eq!(config.volumes.len(), 1);
        assert_eq!(config.environment.get("TZ").map(String::as_str), Some("UTC"));
    }

    #[test]
    fn test_random_ids_differ() {
        let a = ProvisionBuilder::new().build_config();
        let b = ProvisionBuilder::new().build_config();
        assert_ne!(a.session_id, b.session_id);
        assert_ne!(a.session_token, b.session_token);
    }
}
