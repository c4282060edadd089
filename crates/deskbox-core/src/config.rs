//! Session configuration types.

use crate::error::{Result, SessionError};
use deskbox_provider::{ProvisionConfig, ScreenSize, VolumeSpec, DEFAULT_IMAGE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for every configured or per-call timeout (7 days).
pub const MAX_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Desktop flavour running in the container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    #[default]
    Ubuntu,
}

/// Runtime backing the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    #[default]
    Docker,
}

/// Configuration for opening a session.
///
/// Unknown keys are rejected when deserialising.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Desktop flavour (default: ubuntu).
    pub os_type: OsType,
    /// Backing runtime (default: docker).
    pub provider_type: ProviderType,
    /// Suppress the display channel (default: true).
    pub headless: bool,
    /// Display resolution (default: 1920x1080).
    pub screen_size: ScreenSize,
    /// Host-to-container mounts, in order.
    pub volumes: Vec<VolumeSpec>,
    /// Serve the display channel over TLS (default: false).
    pub auto_ssl: bool,
    /// Container image.
    pub image: String,
    /// Readiness budget for `open` (default: 300 s).
    #[serde(rename = "startup_timeout_secs", with = "secs")]
    pub startup_timeout: Duration,
    /// Default command timeout (default: 120 s).
    #[serde(rename = "command_timeout_secs", with = "secs")]
    pub command_timeout: Duration,
    /// Response timeout for ordinary RPCs (default: 60 s).
    #[serde(rename = "rpc_timeout_secs", with = "secs")]
    pub rpc_timeout: Duration,
    /// How long `close` waits for an in-flight call (default: 30 s).
    #[serde(rename = "close_grace_secs", with = "secs")]
    pub close_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            os_type: OsType::default(),
            provider_type: ProviderType::default(),
            headless: true,
            screen_size: ScreenSize::default(),
            volumes: Vec::new(),
            auto_ssl: false,
            image: DEFAULT_IMAGE.to_string(),
            startup_timeout: Duration::from_secs(300),
            command_timeout: Duration::from_secs(120),
            rpc_timeout: Duration::from_secs(60),
            close_grace: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    /// Create a new config builder.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Parse and validate a JSON configuration.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for unknown keys, malformed values or a
    /// configuration that fails [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SessionError::InvalidArgument(format!("invalid session config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an empty image, a zero or over-long
    /// timeout, or two volumes mounted onto the same container path.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(SessionError::InvalidArgument("image is required".into()));
        }
        for (name, value) in [
            ("startup_timeout", self.startup_timeout),
            ("command_timeout", self.command_timeout),
            ("rpc_timeout", self.rpc_timeout),
        ] {
            if value.is_zero() {
                return Err(SessionError::InvalidArgument(format!("{name} must be > 0")));
            }
        }
        for (name, value) in [
            ("startup_timeout", self.startup_timeout),
            ("command_timeout", self.command_timeout),
            ("rpc_timeout", self.rpc_timeout),
            ("close_grace", self.close_grace),
        ] {
            check_max_timeout(name, value)?;
        }
        deskbox_provider::validate_volumes(&self.volumes)
            .map_err(|e| SessionError::InvalidArgument(e.to_string()))
    }

    /// The provider-level configuration for a new container.
    pub fn provision_config(&self) -> ProvisionConfig {
        ProvisionConfig {
            image: self.image.clone(),
            screen_size: self.screen_size,
            headless: self.headless,
            auto_ssl: self.auto_ssl,
            volumes: self.volumes.clone(),
            ..ProvisionConfig::default()
        }
    }
}

/// Reject durations above [`MAX_TIMEOUT`].
pub(crate) fn check_max_timeout(name: &str, value: Duration) -> Result<()> {
    if value > MAX_TIMEOUT {
        return Err(SessionError::InvalidArgument(format!(
            "{name} must be at most {} s, got {} s",
            MAX_TIMEOUT.as_secs(),
            value.as_secs()
        )));
    }
    Ok(())
}

/// Builder for SessionConfig.
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Set headless mode.
    pub fn headless(mut self, headless: bool) -> Self {
        self.config.headless = headless;
        self
    }

    /// Set the display resolution.
    pub fn screen_size(mut self, size: ScreenSize) -> Self {
        self.config.screen_size = size;
        self
    }

    /// Add a mount. Order is preserved.
    pub fn with_volume(mut self, volume: VolumeSpec) -> Self {
        self.config.volumes.push(volume);
        self
    }

    /// Enable TLS on the display channel.
    pub fn auto_ssl(mut self, enabled: bool) -> Self {
        self.config.auto_ssl = enabled;
        self
    }

    /// Set the container image.
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.config.image = image.into();
        self
    }

    /// Set the readiness budget.
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.startup_timeout = timeout;
        self
    }

    /// Set the default command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    /// Set the RPC response timeout.
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout = timeout;
        self
    }

    /// Set how long `close` waits for an in-flight call.
    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.config.close_grace = grace;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Durations as whole seconds.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert!(config.headless);
        assert!(!config.auto_ssl);
        assert_eq!(config.screen_size, ScreenSize::new(1920, 1080));
        assert_eq!(config.os_type, OsType::Ubuntu);
        assert_eq!(config.provider_type, ProviderType::Docker);
        assert!(config.volumes.is_empty());
    }

    #[test]
    fn test_from_json() {
        let config = SessionConfig::from_json(
            r#"{
                "headless": false,
                "screen_size": "1280x720",
                "volumes": ["/data:/mnt/data:ro", "/src:/src"],
                "auto_ssl": true,
                "startup_timeout_secs": 30
            }"#,
        )
        .unwrap();
        assert!(!config.headless);
        assert_eq!(config.screen_size, ScreenSize::new(1280, 720));
        assert_eq!(config.volumes.len(), 2);
        assert!(config.volumes[0].read_only);
        assert_eq!(config.volumes[1].container_path, "/src");
        assert_eq!(config.startup_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = SessionConfig::from_json(r#"{"headles": true}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_bad_values_rejected() {
        assert!(SessionConfig::from_json(r#"{"screen_size": "big"}"#).is_err());
        assert!(SessionConfig::from_json(r#"{"os_type": "windows"}"#).is_err());
        assert!(SessionConfig::from_json(r#"{"volumes": ["relative:path"]}"#).is_err());
    }

    #[test]
    fn test_builder_validation() {
        let result = SessionConfig::builder()
            .command_timeout(Duration::ZERO)
            .build();
        assert!(result.is_err());

        let result = SessionConfig::builder()
            .with_volume("/a:/x".parse().unwrap())
            .with_volume("/b:/x".parse().unwrap())
            .build();
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_huge_timeouts_rejected() {
        let err = SessionConfig::from_json(&format!(r#"{{"command_timeout_secs": {}}}"#, u64::MAX))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = SessionConfig::builder()
            .startup_timeout(Duration::MAX)
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = SessionConfig::builder()
            .close_grace(MAX_TIMEOUT + Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let config = SessionConfig::builder()
            .rpc_timeout(MAX_TIMEOUT)
            .build()
            .unwrap();
        assert_eq!(config.rpc_timeout, MAX_TIMEOUT);
    }

    #[test]
    fn test_provision_config_carries_options() {
        let config = SessionConfig::builder()
            .headless(false)
            .auto_ssl(true)
            .screen_size(ScreenSize::new(800, 600))
            .build()
            .unwrap();
        let provision = config.provision_config();
        assert!(!provision.headless);
        assert!(provision.auto_ssl);
        assert_eq!(provision.screen_size, ScreenSize::new(800, 600));
        assert!(!provision.session_token.is_empty());
    }
}
