//! TCP server loop of the daemon.
//!
//! Binds the configured loopback port, publishes its identity to the
//! runtime info file and answers lookup/status requests until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::daemon::dict::DictSource;
use crate::error::Error;
use crate::protocol::{framing, DaemonInfo, Message};

/// The daemon server that listens for client connections.
pub struct DaemonServer {
    config: Config,
    info_path: PathBuf,
    source: Arc<DictSource>,
}

impl DaemonServer {
    /// Create a new daemon server.
    pub fn new(config: Config) -> Result<Self> {
        let info_path = Config::runtime_info_path()?;
        let source = DictSource::new(&config.source)?;

        Ok(Self {
            config,
            info_path,
            source: Arc::new(source),
        })
    }

    /// Run the daemon server until interrupted.
    ///
    /// A port held by someone else surfaces as [`Error::PortInUse`] so the
    /// caller can print something actionable instead of a bind backtrace.
    pub async fn run(&self) -> Result<()> {
        let port = self.config.port;
        let listener = match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                return Err(Error::PortInUse { port }.into());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to bind 127.0.0.1:{port}"));
            }
        };

        let identity = DaemonInfo {
            pid: std::process::id(),
            port,
            started_at: Utc::now().timestamp(),
        };
        self.write_runtime_info(&identity).await?;

        info!(
            "Daemon listening on 127.0.0.1:{port} (source: {})",
            self.source.endpoint()
        );

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let source = Arc::clone(&self.source);
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, source, identity).await {
                                    error!("Error handling client: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = &mut ctrl_c => {
                    info!("Interrupt received, shutting down");
                    self.remove_runtime_info().await;
                    return Ok(());
                }
            }
        }
    }

    /// Publish pid, port and start time for discovery and status display.
    async fn write_runtime_info(&self, identity: &DaemonInfo) -> Result<()> {
        if let Some(parent) = self.info_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_string(identity)?;
        tokio::fs::write(&self.info_path, contents).await?;
        info!("Runtime info written to {}", self.info_path.display());
        Ok(())
    }

    async fn remove_runtime_info(&self) {
        if let Err(err) = tokio::fs::remove_file(&self.info_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                error!("Failed to remove runtime info file: {err}");
            }
        }
    }
}

/// Handle a single client connection.
async fn handle_client(
    mut stream: TcpStream,
    source: Arc<DictSource>,
    identity: DaemonInfo,
) -> Result<()> {
    debug!("Client connected");

    let message: Message = framing::read_message(&mut stream).await?;

    match message {
        Message::Lookup(request) => {
            debug!("Received lookup: {}", request.query);

            let response = match source.lookup(&request.query).await {
                Ok(response) => response,
                Err(e) => {
                    error!("Lookup failed: {}", e);
                    crate::protocol::LookupResponse::error(e.to_string())
                }
            };
            framing::write_message(&mut stream, &response).await?;
        }
        Message::Status => {
            framing::write_message(&mut stream, &identity).await?;
        }
    }

    debug!("Response sent");
    Ok(())
}
