//! deskbox-server: control server for deskbox desktop containers.

use anyhow::Context;
use deskbox_server::{Server, ServerConfig};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("deskbox_server=info".parse()?),
        )
        .init();

    info!(version = deskbox_server::SERVER_VERSION, "deskbox-server starting...");

    let config = ServerConfig::from_env().context("invalid server configuration")?;
    let server = Server::bind(config)
        .await
        .context("failed to start control server")?;

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    server
        .run(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        })
        .await?;

    info!("deskbox-server stopped");
    Ok(())
}
