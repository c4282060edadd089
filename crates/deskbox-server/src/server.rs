//! TCP accept loop and per-connection protocol handling.
//!
//! Each connection starts with a one-line handshake (`AUTH <token>`),
//! answered with `OK <version>` or `ERR <reason>`. After that, requests and
//! responses are newline-delimited JSON-RPC, strictly in order.

use crate::config::ServerConfig;
use crate::handler::Handler;
use crate::protocol::{error_codes, Request, Response};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Version reported in the handshake.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long a client may take to send its handshake line.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The control server.
pub struct Server {
    listener: TcpListener,
    handler: Arc<Handler>,
    token: Option<Arc<str>>,
}

impl Server {
    /// Bind the listen address from `config`.
    ///
    /// # Errors
    /// Returns an error if the address cannot be bound.
    pub async fn bind(config: ServerConfig) -> crate::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        let token = config.session_token.as_deref().map(Arc::from);
        let handler = Arc::new(Handler::new(config)?);
        info!(addr = %listener.local_addr()?, auth = token.is_some(), "listening for connections");
        Ok(Self {
            listener,
            handler,
            token,
        })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve connections until `shutdown` resolves.
    ///
    /// An active recording is stopped before returning.
    pub async fn run<F>(self, shutdown: F) -> crate::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "accepted new connection");
                        let handler = self.handler.clone();
                        let token = self.token.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, handler, token).await {
                                warn!(peer = %peer, error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                    }
                },
            }
        }
        self.handler.shutdown().await;
        Ok(())
    }
}

/// Handle a single client connection.
async fn handle_connection(
    stream: TcpStream,
    handler: Arc<Handler>,
    token: Option<Arc<str>>,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let greeting = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line)).await;
    let verdict = match greeting {
        Ok(Ok(0)) => return Ok(()),
        Ok(Ok(_)) => check_auth(line.trim_end(), token.as_deref()),
        Ok(Err(e)) => return Err(e),
        Err(_) => Err("handshake timed out"),
    };
    match verdict {
        Ok(()) => {
            writer
                .write_all(format!("OK {SERVER_VERSION}\n").as_bytes())
                .await?;
            writer.flush().await?;
        }
        Err(reason) => {
            warn!(reason, "handshake rejected");
            writer.write_all(format!("ERR {reason}\n").as_bytes()).await?;
            writer.flush().await?;
            return Ok(());
        }
    }

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            debug!("client disconnected");
            break;
        }
        if !line.ends_with('\n') {
            debug!(bytes = bytes_read, "discarding unterminated line");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(req) => handler.handle(req).await,
            Err(e) => {
                warn!(error = %e, "failed to parse request");
                Response::error(0, error_codes::PARSE_ERROR, format!("parse error: {e}"))
            }
        };

        let json = serde_json::to_string(&response)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}

fn check_auth(line: &str, expected: Option<&str>) -> Result<(), &'static str> {
    let Some(presented) = line.strip_prefix("AUTH") else {
        return Err("expected AUTH");
    };
    let presented = presented.trim();
    match expected {
        None => Ok(()),
        Some(expected) if presented == expected => Ok(()),
        Some(_) => Err("invalid token"),
    }
}
