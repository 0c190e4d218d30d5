//! Backend connectors
//!
//! The gateway core only sees [`ToolBackend`] and [`ConnectorFactory`]. The
//! MCP implementations here wrap a [`Transport`] and are what the binary uses.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{BackendConfig, TransportConfig};
use crate::protocol::{JsonRpcError, Tool, ToolsCallParams, ToolsListParams, ToolsListResult};
use crate::transport::{HttpTransport, StdioTransport, Transport};
use crate::{Error, Result};

/// Upper bound on `tools/list` pages fetched from one backend
const MAX_LIST_PAGES: usize = 64;

/// One backend's tool listing
#[derive(Debug, Clone, Default)]
pub struct ToolListing {
    /// Tools in the order the backend returned them
    pub tools: Vec<Tool>,
}

/// What a backend answered to `tools/call`
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallOutcome {
    /// The `result` member, relayed as-is
    Result(Value),
    /// The backend's own JSON-RPC error object, relayed as-is
    Error(JsonRpcError),
}

/// Capability-query handle for one downstream server
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Fetch the full tool listing within `timeout`
    async fn list_tools(&self, timeout: Duration) -> Result<ToolListing>;

    /// Invoke `name` (un-namespaced) within `timeout`
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<ToolCallOutcome>;

    /// Release the underlying transport
    async fn shutdown(&self) -> Result<()>;
}

/// Builds connected backends from configuration
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    /// Connect `id` using `config`; the returned backend is ready for calls
    async fn connect(&self, id: &str, config: &BackendConfig) -> Result<Arc<dyn ToolBackend>>;
}

/// A live backend plus the configuration it was built from
#[derive(Clone)]
pub struct Connector {
    /// Unique, stable connector id
    pub id: String,
    /// Descriptor the backend was built from; compared on reload
    pub config: BackendConfig,
    /// Capability-query handle
    pub backend: Arc<dyn ToolBackend>,
}

impl Connector {
    /// Bundle a connected backend with its id and descriptor
    pub fn new(id: impl Into<String>, config: BackendConfig, backend: Arc<dyn ToolBackend>) -> Self {
        Self {
            id: id.into(),
            config,
            backend,
        }
    }

    /// `true` when both connectors share the same backend instance
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend)
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("id", &self.id)
            .field("transport", &self.config.transport.transport_type())
            .finish_non_exhaustive()
    }
}

/// MCP backend over any [`Transport`]
pub struct McpBackend {
    id: String,
    transport: Arc<dyn Transport>,
    request_count: AtomicU64,
}

impl McpBackend {
    /// Wrap an initialized transport
    pub fn new(id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: id.into(),
            transport,
            request_count: AtomicU64::new(0),
        }
    }

    /// Requests sent so far
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    async fn fetch_all_pages(&self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .take()
                .map(|c| serde_json::to_value(ToolsListParams { cursor: Some(c) }))
                .transpose()?;
            self.request_count.fetch_add(1, Ordering::Relaxed);
            let result = self.transport.request_result("tools/list", params).await?;
            if result.is_null() {
                break;
            }
            let page: ToolsListResult = serde_json::from_value(result)?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(tools)
    }
}

#[async_trait]
impl ToolBackend for McpBackend {
    async fn list_tools(&self, timeout: Duration) -> Result<ToolListing> {
        let tools = tokio::time::timeout(timeout, self.fetch_all_pages())
            .await
            .map_err(|_| {
                Error::BackendTimeout(format!("{} tools/list exceeded {timeout:?}", self.id))
            })??;
        debug!(connector = %self.id, count = tools.len(), "Fetched tool listing");
        Ok(ToolListing { tools })
    }

    #[tracing::instrument(skip(self, arguments), fields(connector = %self.id))]
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<ToolCallOutcome> {
        if !self.transport.is_connected() {
            return Err(Error::Transport(format!("{} is disconnected", self.id)));
        }
        let params = serde_json::to_value(ToolsCallParams {
            name: name.to_string(),
            arguments,
        })?;
        let start = Instant::now();
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let response = tokio::time::timeout(timeout, self.transport.request("tools/call", Some(params)))
            .await
            .map_err(|_| {
                Error::BackendTimeout(format!("{}/{name} exceeded {timeout:?}", self.id))
            })??;

        debug!(
            latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            is_error = response.is_error(),
            "Tool call answered"
        );

        Ok(match response.error {
            Some(err) => ToolCallOutcome::Error(err),
            None => ToolCallOutcome::Result(response.result.unwrap_or(Value::Null)),
        })
    }

    async fn shutdown(&self) -> Result<()> {
        info!(connector = %self.id, "Closing backend transport");
        self.transport.close().await
    }
}

/// Connects MCP backends over stdio or HTTP
#[derive(Debug, Clone, Copy, Default)]
pub struct McpConnectorFactory;

#[async_trait]
impl ConnectorFactory for McpConnectorFactory {
    async fn connect(&self, id: &str, config: &BackendConfig) -> Result<Arc<dyn ToolBackend>> {
        info!(connector = %id, transport = config.transport.transport_type(), "Connecting backend");

        let transport: Arc<dyn Transport> = match &config.transport {
            TransportConfig::Stdio { command, cwd } => {
                let transport = StdioTransport::new(
                    id,
                    command,
                    config.env.clone(),
                    cwd.clone(),
                    config.timeout,
                );
                transport.start().await?;
                transport
            }
            TransportConfig::Http {
                http_url,
                streamable_http,
            } => {
                if http_url.is_empty() {
                    return Err(Error::Config(format!(
                        "Backend '{id}' has neither a command nor an http_url"
                    )));
                }
                let transport = HttpTransport::new(
                    id,
                    http_url,
                    config.headers.clone(),
                    config.timeout,
                    *streamable_http,
                )?;
                transport.initialize().await?;
                transport
            }
        };

        Ok(Arc::new(McpBackend::new(id, transport)))
    }
}
