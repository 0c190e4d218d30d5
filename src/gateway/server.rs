//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::dispatcher::Dispatcher;
use super::router::{AppState, create_router};
use super::stdio::serve_lines;
use crate::backend::{ConnectorFactory, McpConnectorFactory};
use crate::config::Config;
use crate::control::{ControlHandler, ControlServer};
use crate::{Error, Result};

/// Where calls arrive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPlane {
    /// `POST /mcp` on the configured address
    Http,
    /// Newline-delimited JSON-RPC on stdin/stdout
    Stdio,
}

/// MCP hub gateway: dispatcher plus its data and control planes
pub struct Gateway {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    data_plane: DataPlane,
}

impl Gateway {
    /// Connect backends over MCP and build the first route table
    pub async fn new(config: Config, data_plane: DataPlane) -> Result<Self> {
        Self::with_factory(config, data_plane, Arc::new(McpConnectorFactory)).await
    }

    /// Same as [`Self::new`] with a caller-supplied connector factory
    pub async fn with_factory(
        config: Config,
        data_plane: DataPlane,
        factory: Arc<dyn ConnectorFactory>,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::start(config.clone(), factory).await?;
        Ok(Self {
            config,
            dispatcher,
            data_plane,
        })
    }

    /// The dispatcher serving this gateway
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Run until `stop`, Ctrl-C or SIGTERM (or stdin EOF in stdio mode),
    /// then drain.
    pub async fn run(self) -> Result<()> {
        let shutdown_tx = self.dispatcher.shutdown_sender();
        tokio::spawn(shutdown_signal(shutdown_tx.clone()));

        let control = if self.config.control.enabled {
            let handler: Arc<dyn ControlHandler> = self.dispatcher.clone();
            let server = ControlServer::new(self.dispatcher.endpoint().clone(), handler);
            let rx = shutdown_tx.subscribe();
            Some(tokio::spawn(async move {
                if let Err(e) = server.run(rx).await {
                    error!(error = %e, "Control server failed; reload/stop/status unavailable");
                }
            }))
        } else {
            info!("Control server disabled");
            None
        };

        self.log_banner();

        let served = match self.data_plane {
            DataPlane::Stdio => {
                serve_lines(
                    Arc::clone(&self.dispatcher),
                    tokio::io::stdin(),
                    tokio::io::stdout(),
                    shutdown_tx.subscribe(),
                )
                .await
            }
            DataPlane::Http if self.config.server.enabled => {
                self.serve_http(shutdown_tx.subscribe()).await
            }
            DataPlane::Http => {
                info!("HTTP data plane disabled; waiting for stop");
                let mut rx = shutdown_tx.subscribe();
                let _ = rx.recv().await;
                Ok(())
            }
        };

        // Stdin EOF ends the stdio plane without a broadcast; tell the rest.
        let _ = shutdown_tx.send(());
        self.dispatcher
            .drain(self.dispatcher.shutdown_timeout())
            .await;
        if let Some(control) = control {
            let _ = control.await;
        }
        served
    }

    async fn serve_http(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = create_router(Arc::new(AppState {
            dispatcher: Arc::clone(&self.dispatcher),
        }));
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "HTTP data plane listening (POST /mcp, GET /health)");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await
            .map_err(|e| Error::Internal(e.to_string()))
    }

    fn log_banner(&self) {
        let snapshot = self.dispatcher.snapshot();
        info!("============================================================");
        info!(version = %snapshot.version, pid = snapshot.pid, "mcp-hub starting");
        info!(connectors = ?snapshot.connectors, tools = snapshot.tool_count, "Routes");
        if !snapshot.degraded_connectors.is_empty() {
            warn!(connectors = ?snapshot.degraded_connectors, "Connectors missing from catalog");
        }
        if self.config.control.enabled {
            info!(endpoint = %snapshot.control_endpoint, "Control endpoint");
        }
        info!("============================================================");
    }
}

/// Broadcast shutdown on Ctrl-C or SIGTERM
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
