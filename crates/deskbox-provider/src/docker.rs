//! Docker-backed provider.
//!
//! Talks to the local Docker Engine through bollard. Each session gets one
//! container named `deskbox-<session_id>` and labelled with the session id,
//! so [`DockerProvider::list`] can find containers this provider owns.

use crate::config::{ProvisionConfig, BROWSER_PORT, CONTROL_PORT, DISPLAY_PORT};
use crate::error::{ProviderError, Result};
use crate::provider::{probe_endpoint, ContainerHandle, Provider};
use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding, PortMap};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    ListContainersOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures::TryStreamExt;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Label carrying the session id on every container we create.
pub const SESSION_LABEL: &str = "deskbox.session";

/// Seconds the runtime waits for a graceful stop before killing.
const STOP_GRACE_SECS: i32 = 5;

/// Host address ports are published on.
const PUBLISH_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Provider backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerProvider {
    docker: Docker,
}

impl DockerProvider {
    /// Connect using the platform defaults (`DOCKER_HOST` or the local socket).
    ///
    /// Connecting is lazy; an unreachable daemon is reported by
    /// [`Provider::provision`] as [`ProviderError::RuntimeUnavailable`].
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ProviderError::RuntimeUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Wrap an existing bollard client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Container name for a session.
    pub fn container_name(session_id: &str) -> String {
        format!("deskbox-{session_id}")
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            tracing::debug!(image, "Image present locally");
            return Ok(());
        }

        let (from_image, tag) = split_image_tag(image);
        tracing::info!(image, "Pulling image");
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| ProviderError::ImagePull {
                image: image.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn create_and_start(&self, name: &str, config: &ProvisionConfig) -> Result<String> {
        let ports = config.published_ports();

        let exposed_ports: HashMap<String, HashMap<(), ()>> = ports
            .iter()
            .map(|p| (port_key(*p), HashMap::new()))
            .collect();

        // Empty host port lets the runtime pick a free ephemeral port
        let port_bindings: PortMap = ports
            .iter()
            .map(|p| {
                (
                    port_key(*p),
                    Some(vec![PortBinding {
                        host_ip: Some(PUBLISH_HOST.to_string()),
                        host_port: Some(String::new()),
                    }]),
                )
            })
            .collect();

        let binds: Vec<String> = config.volumes.iter().map(|v| v.to_bind()).collect();

        let body = ContainerCreateBody {
            image: Some(config.image.clone()),
            env: Some(config.container_env()),
            labels: Some(HashMap::from([(
                SESSION_LABEL.to_string(),
                config.session_id.clone(),
            )])),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                binds: if binds.is_empty() { None } else { Some(binds) },
                port_bindings: Some(port_bindings),
                shm_size: Some(config.shm_size),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(name).build()),
                body,
            )
            .await
            .map_err(|e| ProviderError::Create(e.to_string()))?;
        tracing::debug!(container = name, id = %created.id, "Container created");

        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await
            .map_err(|e| ProviderError::Start(e.to_string()))?;
        tracing::debug!(container = name, "Container started");

        Ok(created.id)
    }

    async fn resolve_ports(&self, name: &str) -> Result<PortMap> {
        let info = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| ProviderError::PortAllocation(format!("inspect failed: {e}")))?;

        info.network_settings
            .and_then(|n| n.ports)
            .ok_or_else(|| ProviderError::PortAllocation("no published ports reported".into()))
    }

    async fn remove(&self, name: &str) -> Result<()> {
        // A stop failure is fine here; the forced remove below decides
        if let Err(e) = self
            .docker
            .stop_container(
                name,
                Some(StopContainerOptionsBuilder::new().t(STOP_GRACE_SECS).build()),
            )
            .await
        {
            if !is_not_found(&e) {
                tracing::debug!(container = name, error = %e, "Stop failed, forcing removal");
            }
        }

        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => {
                tracing::debug!(container = name, "Container already removed");
                Ok(())
            }
            Err(e) => Err(ProviderError::Remove(e.to_string())),
        }
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn provision(&self, config: &ProvisionConfig) -> Result<ContainerHandle> {
        config.validate()?;
        let start = std::time::Instant::now();
        let name = Self::container_name(&config.session_id);
        tracing::info!(
            session_id = %config.session_id,
            image = %config.image,
            screen_size = %config.screen_size,
            headless = config.headless,
            "Provisioning desktop container"
        );

        self.docker
            .ping()
            .await
            .map_err(|e| ProviderError::RuntimeUnavailable(e.to_string()))?;

        self.ensure_image(&config.image).await?;

        let container_id = match self.create_and_start(&name, config).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(container = %name, error = %e, "Container bring-up failed");
                if let Err(cleanup) = self.remove(&name).await {
                    tracing::warn!(container = %name, error = %cleanup, "Cleanup after failed bring-up failed");
                }
                return Err(e);
            }
        };

        let endpoints = self
            .resolve_ports(&name)
            .await
            .and_then(|ports| Endpoints::from_port_map(&ports, config.headless));
        let endpoints = match endpoints {
            Ok(e) => e,
            Err(e) => {
                tracing::error!(container = %name, error = %e, "Port resolution failed");
                if let Err(cleanup) = self.remove(&name).await {
                    tracing::warn!(container = %name, error = %cleanup, "Cleanup after port failure failed");
                }
                return Err(e);
            }
        };

        tracing::info!(
            session_id = %config.session_id,
            control = %endpoints.control,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Desktop container running"
        );

        Ok(ContainerHandle {
            session_id: config.session_id.clone(),
            container_id,
            control_endpoint: endpoints.control,
            display_endpoint: endpoints.display,
            browser_endpoint: endpoints.browser,
            session_token: config.session_token.clone(),
            auto_ssl: config.auto_ssl,
        })
    }

    async fn health_check(&self, handle: &ContainerHandle) -> bool {
        probe_endpoint(handle.control_endpoint).await
    }

    async fn terminate(&self, handle: &ContainerHandle) -> Result<()> {
        let name = Self::container_name(&handle.session_id);
        tracing::info!(session_id = %handle.session_id, "Terminating desktop container");
        self.remove(&name).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptionsBuilder::new().all(true).build()))
            .await
            .map_err(|e| ProviderError::RuntimeUnavailable(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| c.labels.and_then(|mut l| l.remove(SESSION_LABEL)))
            .collect())
    }
}

/// Host endpoints resolved from a container's published ports.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoints {
    control: SocketAddr,
    display: Option<SocketAddr>,
    browser: Option<SocketAddr>,
}

impl Endpoints {
    fn from_port_map(ports: &PortMap, headless: bool) -> Result<Self> {
        let control = host_addr(ports, CONTROL_PORT).ok_or_else(|| {
            ProviderError::PortAllocation(format!("control port {CONTROL_PORT} was not published"))
        })?;
        let display = if headless {
            None
        } else {
            Some(host_addr(ports, DISPLAY_PORT).ok_or_else(|| {
                ProviderError::PortAllocation(format!(
                    "display port {DISPLAY_PORT} was not published"
                ))
            })?)
        };
        Ok(Self {
            control,
            display,
            browser: host_addr(ports, BROWSER_PORT),
        })
    }
}

fn port_key(port: u16) -> String {
    format!("{port}/tcp")
}

fn host_addr(ports: &PortMap, container_port: u16) -> Option<SocketAddr> {
    let bindings = ports.get(&port_key(container_port))?.as_ref()?;
    bindings.iter().find_map(|b| {
        let port: u16 = b.host_port.as_deref()?.parse().ok()?;
        if port == 0 {
            return None;
        }
        let ip = b
            .host_ip
            .as_deref()
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .filter(|ip| !ip.is_unspecified())
            .unwrap_or(IpAddr::V4(PUBLISH_HOST));
        Some(SocketAddr::new(ip, port))
    })
}

fn split_image_tag(image: &str) -> (&str, &str) {
    // A colon after the last slash is a tag; before it, a registry port
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, "latest"),
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404
    )
}
