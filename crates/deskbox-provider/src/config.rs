//! Configuration types for desktop containers.

use crate::error::{ProviderError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Default desktop image.
pub const DEFAULT_IMAGE: &str = "deskbox/ubuntu-xfce4:latest";

/// Port the control server listens on inside the container.
pub const CONTROL_PORT: u16 = 5000;

/// Port of the noVNC display server inside the container.
pub const DISPLAY_PORT: u16 = 8006;

/// Chromium remote debugging port inside the container.
pub const BROWSER_PORT: u16 = 9222;

/// Shared memory size given to the container (4 GiB).
pub const DEFAULT_SHM_SIZE: i64 = 4 * 1024 * 1024 * 1024;

/// Display resolution, written as `WxH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

impl ScreenSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for ScreenSize {
    fn default() -> Self {
        Self::new(1920, 1080)
    }
}

impl fmt::Display for ScreenSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ScreenSize {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| ProviderError::Config(format!("screen size must be WxH, got {s:?}")))?;
        let parse = |v: &str| {
            v.parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ProviderError::Config(format!("invalid screen dimension {v:?}")))
        };
        Ok(Self::new(parse(w)?, parse(h)?))
    }
}

impl TryFrom<String> for ScreenSize {
    type Error = ProviderError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ScreenSize> for String {
    fn from(size: ScreenSize) -> Self {
        size.to_string()
    }
}

/// A host-to-container bind mount, written as `host:container[:ro|:rw]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolumeSpec {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl VolumeSpec {
    /// The bind string understood by the container runtime.
    pub fn to_bind(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for VolumeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_path.display(), self.container_path)?;
        if self.read_only {
            write!(f, ":ro")?;
        }
        Ok(())
    }
}

impl FromStr for VolumeSpec {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let (host, container, read_only) = match parts.as_slice() {
            [host, container] => (*host, *container, false),
            [host, container, "ro"] => (*host, *container, true),
            [host, container, "rw"] => (*host, *container, false),
            _ => {
                return Err(ProviderError::Config(format!(
                    "volume must be host:container[:ro|:rw], got {s:?}"
                )))
            }
        };
        if host.is_empty() || container.is_empty() {
            return Err(ProviderError::Config(format!("volume has an empty path: {s:?}")));
        }
        if !container.starts_with('/') {
            return Err(ProviderError::Config(format!(
                "container path must be absolute: {container:?}"
            )));
        }
        Ok(Self {
            host_path: PathBuf::from(host),
            container_path: container.to_string(),
            read_only,
        })
    }
}

impl TryFrom<String> for VolumeSpec {
    type Error = ProviderError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<VolumeSpec> for String {
    fn from(spec: VolumeSpec) -> Self {
        spec.to_string()
    }
}

/// Everything a provider needs to bring up one desktop container.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Unique session identifier, also used to name the container
    pub session_id: String,
    /// Shared secret the control server expects in the connection handshake
    pub session_token: String,
    /// Image to run
    pub image: String,
    /// Display resolution
    pub screen_size: ScreenSize,
    /// Skip publishing the display port
    pub headless: bool,
    /// Serve the display channel over TLS
    pub auto_ssl: bool,
    /// Bind mounts, in order
    pub volumes: Vec<VolumeSpec>,
    /// Shared memory size in bytes
    pub shm_size: i64,
    /// Extra environment passed to the container
    pub environment: BTreeMap<String, String>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            session_token: uuid::Uuid::new_v4().simple().to_string(),
            image: DEFAULT_IMAGE.into(),
            screen_size: ScreenSize::default(),
            headless: true,
            auto_ssl: false,
            volumes: Vec::new(),
            shm_size: DEFAULT_SHM_SIZE,
            environment: BTreeMap::new(),
        }
    }
}

impl ProvisionConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.session_id.is_empty() {
            return Err(ProviderError::Config("session_id is required".into()));
        }
        if self.image.trim().is_empty() {
            return Err(ProviderError::Config("image is required".into()));
        }
        if self.shm_size <= 0 {
            return Err(ProviderError::Config(format!(
                "shm_size must be positive, got {}",
                self.shm_size
            )));
        }
        validate_volumes(&self.volumes)
    }

    /// Container environment in `KEY=VALUE` form.
    pub fn container_env(&self) -> Vec<String> {
        let mut env = BTreeMap::new();
        env.insert("SCREEN_SIZE".to_string(), format!("{}x24", self.screen_size));
        env.insert(
            "DESKBOX_SESSION_TOKEN".to_string(),
            self.session_token.clone(),
        );
        env.insert("SESSION_PASSWORD".to_string(), self.session_token.clone());
        env.insert("SSL_ENABLED".to_string(), self.auto_ssl.to_string());
        env.insert(
            "NOVNC_SERVER_ENABLED".to_string(),
            (!self.headless).to_string(),
        );
        for (key, value) in &self.environment {
            env.insert(key.clone(), value.clone());
        }
        env.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Container ports that must be published to the host.
    pub fn published_ports(&self) -> Vec<u16> {
        if self.headless {
            vec![CONTROL_PORT, BROWSER_PORT]
        } else {
            vec![CONTROL_PORT, BROWSER_PORT, DISPLAY_PORT]
        }
    }
}

/// Check a mount list: two mounts onto the same container path would
/// shadow each other.
///
/// # Errors
/// Returns `Config` naming the first duplicated container path.
pub fn validate_volumes(volumes: &[VolumeSpec]) -> Result<()> {
    let mut targets: Vec<&str> = Vec::with_capacity(volumes.len());
    for volume in volumes {
        if targets.contains(&volume.container_path.as_str()) {
            return Err(ProviderError::Config(format!(
                "duplicate volume target: {}",
                volume.container_path
            )));
        }
        targets.push(&volume.container_path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screen_size_parse() {
        let size: ScreenSize = "1366x768".parse().unwrap();
        assert_eq!(size, ScreenSize::new(1366, 768));
        assert_eq!(size.to_string(), "1366x768");

        assert!("1366".parse::<ScreenSize>().is_err());
        assert!("0x768".parse::<ScreenSize>().is_err());
        assert!("wide x tall".parse::<ScreenSize>().is_err());
    }

    #[test]
    fn test_volume_parse() {
        let vol: VolumeSpec = "/data:/home/user/data:ro".parse().unwrap();
        assert_eq!(vol.host_path, PathBuf::from("/data"));
        assert_eq!(vol.container_path, "/home/user/data");
        assert!(vol.read_only);
        assert_eq!(vol.to_bind(), "/data:/home/user/data:ro");

        let vol: VolumeSpec = "/data:/mnt".parse().unwrap();
        assert!(!vol.read_only);

        assert!("/data".parse::<VolumeSpec>().is_err());
        assert!("/data:relative".parse::<VolumeSpec>().is_err());
        assert!("/data:/mnt:rx".parse::<VolumeSpec>().is_err());
    }

    #[test]
    fn test_validate_duplicate_targets() {
        let mut config = ProvisionConfig::default();
        config.volumes.push("/a:/mnt".parse().unwrap());
        assert!(config.validate().is_ok());

        config.volumes.push("/b:/mnt".parse().unwrap());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_volumes() {
        let a: VolumeSpec = "/a:/mnt/a".parse().unwrap();
        let b: VolumeSpec = "/b:/mnt/b:ro".parse().unwrap();
        let clash: VolumeSpec = "/c:/mnt/a".parse().unwrap();

        assert!(validate_volumes(&[]).is_ok());
        assert!(validate_volumes(&[a.clone(), b.clone()]).is_ok());
        let err = validate_volumes(&[a, b, clash]).unwrap_err();
        assert!(err.to_string().contains("/mnt/a"), "{err}");
    }

    #[test]
    fn test_headless_skips_display_port() {
        let mut config = ProvisionConfig::default();
        assert!(!config.published_ports().contains(&DISPLAY_PORT));

        config.headless = false;
        assert!(config.published_ports().contains(&DISPLAY_PORT));
    }

    #[test]
    fn test_container_env() {
        let mut config = ProvisionConfig {
            session_token: "secret".into(),
            screen_size: ScreenSize::new(1280, 720),
            ..Default::default()
        };
        config.environment.insert("LANG".into(), "C.UTF-8".into());

        let env = config.container_env();
        assert!(env.contains(&"SCREEN_SIZE=1280x720x24".to_string()));
        assert!(env.contains(&"DESKBOX_SESSION_TOKEN=secret".to_string()));
        assert!(env.contains(&"SSL_ENABLED=false".to_string()));
        assert!(env.contains(&"LANG=C.UTF-8".to_string()));
    }
}
