//! The provider seam between sessions and the container runtime.

use crate::config::ProvisionConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// Timeout for the reachability probe in [`probe_endpoint`].
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A provisioned container and the host endpoints that reach into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Session this container belongs to
    pub session_id: String,
    /// Runtime-specific container identifier
    pub container_id: String,
    /// Host address of the control server
    pub control_endpoint: SocketAddr,
    /// Host address of the display server, absent when headless
    pub display_endpoint: Option<SocketAddr>,
    /// Host address of the browser debugging port
    pub browser_endpoint: Option<SocketAddr>,
    /// Token expected by the control server handshake
    pub session_token: String,
    /// Whether the display channel is served over TLS
    pub auto_ssl: bool,
}

impl ContainerHandle {
    /// noVNC URL for watching the desktop, if a display endpoint exists.
    pub fn vnc_url(&self) -> Option<String> {
        let addr = self.display_endpoint?;
        let scheme = if self.auto_ssl { "https" } else { "http" };
        let host = addr.ip();
        let port = addr.port();
        let mut url =
            format!("{scheme}://{host}:{port}/vnc.html?host={host}&port={port}&autoconnect=true");
        if !self.session_token.is_empty() {
            url.push_str("&password=");
            url.push_str(&self.session_token);
        }
        Some(url)
    }

    /// Browser remote debugging URL, if the port is published.
    pub fn browser_url(&self) -> Option<String> {
        self.browser_endpoint.map(|addr| format!("http://{addr}"))
    }
}

/// Container lifecycle operations.
///
/// Implementations hold no authoritative state beyond what they need to map
/// handles to runtime objects; the runtime itself is the source of truth.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short name of the backing runtime, for logs.
    fn name(&self) -> &str;

    /// Create and start a container, returning its endpoints.
    ///
    /// Nothing is left running when this returns an error.
    async fn provision(&self, config: &ProvisionConfig) -> Result<ContainerHandle>;

    /// Lightweight reachability probe of the control endpoint.
    async fn health_check(&self, handle: &ContainerHandle) -> bool;

    /// Stop and remove the container. Terminating an already removed
    /// container succeeds.
    async fn terminate(&self, handle: &ContainerHandle) -> Result<()>;

    /// Session ids of all containers this provider currently owns.
    async fn list(&self) -> Result<Vec<String>>;
}

/// Check whether a TCP endpoint accepts connections within [`PROBE_TIMEOUT`].
pub async fn probe_endpoint(addr: SocketAddr) -> bool {
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::trace!(%addr, error = %e, "Probe connection refused");
            false
        }
        Err(_) => {
            tracing::trace!(%addr, "Probe timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> ContainerHandle {
        ContainerHandle {
            session_id: "s1".into(),
            container_id: "c1".into(),
            control_endpoint: "127.0.0.1:5000".parse().unwrap(),
            display_endpoint: Some("127.0.0.1:8006".parse().unwrap()),
            browser_endpoint: Some("127.0.0.1:9222".parse().unwrap()),
            session_token: "tok".into(),
            auto_ssl: false,
        }
    }

    #[test]
    fn test_vnc_url() {
        let url = handle().vnc_url().unwrap();
        assert_eq!(
            url,
            "http://127.0.0.1:8006/vnc.html?host=127.0.0.1&port=8006&autoconnect=true&password=tok"
        );

        let mut tls = handle();
        tls.auto_ssl = true;
        assert!(tls.vnc_url().unwrap().starts_with("https://"));
    }

    #[test]
    fn test_headless_has_no_vnc_url() {
        let mut h = handle();
        h.display_endpoint = None;
        assert!(h.vnc_url().is_none());
    }

    #[test]
    fn test_browser_url() {
        assert_eq!(handle().browser_url().unwrap(), "http://127.0.0.1:9222");
    }

    #[tokio::test]
    async fn test_probe_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(probe_endpoint(addr).await);

        drop(listener);
        assert!(!probe_endpoint(addr).await);
    }
}
