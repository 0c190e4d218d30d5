//! Inbound call dispatch and the live route table
//!
//! Every call captures the current [`RouteTable`] once and uses it to the
//! end, so a concurrent `reload` is observed entirely or not at all.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::{Value, json};
use tokio::sync::{Mutex, Notify, Semaphore, broadcast};
use tracing::{debug, info, warn};

use super::aggregator::{Aggregation, find_connector, get_aggregated_tools, parse_namespace};
use crate::backend::{Connector, ConnectorFactory, ToolCallOutcome};
use crate::config::{BackendConfig, Config};
use crate::config_reload::compute_diff;
use crate::control::{ControlEndpoint, ControlHandler, ReloadReport, RuntimeSnapshot};
use crate::error::rpc_codes;
use crate::protocol::{
    AdapterRegistry, Detection, InitializeResult, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ProtocolFamily, RawMessage, ToolsCallParams, ToolsListResult,
};
use crate::security::{PermissionSet, build_a2a_permission, build_mcp_permission};
use crate::{Error, Result};

/// Upper bound on concurrently served calls
pub const MAX_IN_FLIGHT: u32 = 4096;

/// Immutable routing snapshot, swapped whole on reload
#[derive(Debug)]
pub struct RouteTable {
    /// Live connectors in id order
    pub connectors: Vec<Connector>,
    /// Namespaced catalog built from `connectors`
    pub catalog: Aggregation,
    /// Granted permissions
    pub permissions: PermissionSet,
    /// Budget for one forwarded call
    pub call_timeout: Duration,
    /// Budget for one backend listing
    pub list_timeout: Duration,
    /// Configuration as actually applied: only connectors that are live,
    /// with the descriptor each one was built from
    pub config: Config,
    /// When this table was built
    pub built_at: DateTime<Utc>,
    /// Signalled when the last reference to this table goes away
    released: Arc<Notify>,
}

impl RouteTable {
    async fn build(connectors: Vec<Connector>, config: &Config) -> Result<Self> {
        let permissions = PermissionSet::new(config.gateway.permissions.iter().cloned())?;
        let catalog = get_aggregated_tools(&connectors, config.gateway.list_timeout).await;

        let mut applied = config.clone();
        applied.backends = connectors
            .iter()
            .map(|c| (c.id.clone(), c.config.clone()))
            .collect();

        Ok(Self {
            connectors,
            catalog,
            permissions,
            call_timeout: config.gateway.call_timeout,
            list_timeout: config.gateway.list_timeout,
            config: applied,
            built_at: Utc::now(),
            released: Arc::new(Notify::new()),
        })
    }

    /// Connector by id
    #[must_use]
    pub fn find_connector(&self, id: &str) -> Option<&Connector> {
        find_connector(&self.connectors, id)
    }

    /// Active connector ids
    #[must_use]
    pub fn connector_ids(&self) -> Vec<String> {
        self.connectors.iter().map(|c| c.id.clone()).collect()
    }
}

impl Drop for RouteTable {
    fn drop(&mut self) {
        // Stores a permit when nobody is waiting yet.
        self.released.notify_one();
    }
}

/// Serves inbound calls and implements the control-plane commands
pub struct Dispatcher {
    registry: AdapterRegistry,
    routes: RwLock<Arc<RouteTable>>,
    factory: Arc<dyn ConnectorFactory>,
    /// File re-read on `reload`
    config_path: Option<PathBuf>,
    /// Serializes route table rebuilds
    reload_lock: Mutex<()>,
    /// One permit per call being served
    inflight: Arc<Semaphore>,
    draining: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    endpoint: ControlEndpoint,
    shutdown_timeout: Duration,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Dispatcher {
    /// Connect every enabled backend and build the first route table.
    ///
    /// Connectors that fail to come up are left out and retried on the next
    /// `reload`.
    ///
    /// # Errors
    ///
    /// Returns an error only when the configuration itself is invalid.
    pub async fn start(config: Config, factory: Arc<dyn ConnectorFactory>) -> Result<Arc<Self>> {
        config.validate()?;
        let wanted: Vec<(String, BackendConfig)> = config
            .enabled_backends()
            .map(|(id, cfg)| (id.clone(), cfg.clone()))
            .collect();

        let (connected, failed) = connect_all(factory.as_ref(), &wanted).await;
        for id in &failed {
            warn!(connector = %id, "Backend unavailable at startup; will retry on reload");
        }
        let mut connectors: Vec<Connector> = connected.into_values().collect();
        connectors.sort_by(|a, b| a.id.cmp(&b.id));

        let routes = RouteTable::build(connectors, &config).await?;
        info!(
            connectors = routes.connectors.len(),
            tools = routes.catalog.tools.len(),
            "Route table ready"
        );

        let (shutdown_tx, _) = broadcast::channel(4);
        Ok(Arc::new(Self {
            registry: AdapterRegistry::with_defaults(),
            routes: RwLock::new(Arc::new(routes)),
            factory,
            config_path: config.source.clone(),
            reload_lock: Mutex::new(()),
            inflight: Arc::new(Semaphore::new(MAX_IN_FLIGHT as usize)),
            draining: AtomicBool::new(false),
            shutdown_tx,
            endpoint: ControlEndpoint::from_config(&config),
            shutdown_timeout: config.server.shutdown_timeout,
            started: Instant::now(),
            started_at: Utc::now(),
        }))
    }

    /// Current route table
    #[must_use]
    pub fn routes(&self) -> Arc<RouteTable> {
        Arc::clone(&self.routes.read())
    }

    /// Control endpoint this gateway answers on
    #[must_use]
    pub fn endpoint(&self) -> &ControlEndpoint {
        &self.endpoint
    }

    /// Subscribe to the shutdown broadcast
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Sender side of the shutdown broadcast
    #[must_use]
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Calls currently being served
    #[must_use]
    pub fn in_flight(&self) -> usize {
        MAX_IN_FLIGHT as usize - self.inflight.available_permits()
    }

    /// Serve one raw inbound message. `None` means nothing is sent back.
    pub async fn handle(&self, raw: RawMessage) -> Option<JsonRpcResponse> {
        let parsed = match self.registry.detect(&raw) {
            Detection::Parsed(parsed) => parsed,
            Detection::Malformed { protocol } => {
                let err = Error::Parse {
                    protocol: protocol.to_string(),
                    message: "body is not a valid JSON-RPC message".to_string(),
                };
                warn!(%protocol, size = raw.size_bytes(), "Malformed message");
                return Some(JsonRpcResponse::error(None, err.to_rpc_code(), err.to_string()));
            }
            Detection::Unclassified => {
                warn!(size = raw.size_bytes(), "Unclassified message dropped");
                return None;
            }
        };
        debug!(summary = %self.registry.summarize(&parsed, &raw), "Inbound");

        match parsed.decoded {
            Some(JsonRpcMessage::Request(request)) => {
                Some(self.handle_request(parsed.protocol, request).await)
            }
            Some(JsonRpcMessage::Notification(notification)) => {
                handle_notification(&notification);
                None
            }
            Some(JsonRpcMessage::Response(_)) | None => {
                debug!("Ignoring response sent to the gateway");
                None
            }
        }
    }

    async fn handle_request(
        &self,
        protocol: ProtocolFamily,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse {
        let id = request.id.clone();
        if self.draining.load(Ordering::Acquire) {
            return JsonRpcResponse::error(
                Some(id),
                rpc_codes::BACKEND_ERROR,
                "Gateway is shutting down",
            );
        }
        let Ok(_permit) = self.inflight.acquire().await else {
            return JsonRpcResponse::error(
                Some(id),
                rpc_codes::BACKEND_ERROR,
                "Gateway is shutting down",
            );
        };

        let routes = self.routes();
        match self.route(&routes, protocol, request).await {
            Ok(ToolCallOutcome::Result(result)) => JsonRpcResponse::success(id, result),
            Ok(ToolCallOutcome::Error(err)) => JsonRpcResponse::from_error(Some(id), err),
            Err(Error::JsonRpc {
                code,
                message,
                data,
            }) => JsonRpcResponse::from_error(
                Some(id),
                crate::protocol::JsonRpcError {
                    code,
                    message,
                    data,
                },
            ),
            Err(e) => JsonRpcResponse::error(Some(id), e.to_rpc_code(), e.to_string()),
        }
    }

    async fn route(
        &self,
        routes: &RouteTable,
        protocol: ProtocolFamily,
        request: JsonRpcRequest,
    ) -> Result<ToolCallOutcome> {
        let method = request.method.as_str();

        if protocol == ProtocolFamily::Mcp {
            if let Some(result) = answer_lifecycle(method) {
                return Ok(ToolCallOutcome::Result(result?));
            }
        }

        let call = if protocol == ProtocolFamily::Mcp && method == "tools/call" {
            Some(parse_call_params(request.params.clone())?)
        } else {
            None
        };
        let target = call
            .as_ref()
            .map(|c| parse_namespace(&c.name).map_or(c.name.as_str(), |(id, _)| id));

        let required = match protocol {
            ProtocolFamily::Mcp => build_mcp_permission(method, target),
            ProtocolFamily::A2a => build_a2a_permission(method, target),
        };
        routes.permissions.check(&required)?;

        match (protocol, call) {
            (ProtocolFamily::Mcp, Some(call)) => self.call_tool(routes, call).await,
            (ProtocolFamily::Mcp, None) if method == "tools/list" => {
                let listing = ToolsListResult {
                    tools: routes.catalog.tools.iter().map(|t| t.advertised()).collect(),
                    next_cursor: None,
                };
                Ok(ToolCallOutcome::Result(serde_json::to_value(listing)?))
            }
            _ => Err(Error::json_rpc(
                rpc_codes::METHOD_NOT_FOUND,
                format!("Method not found: {method}"),
            )),
        }
    }

    #[tracing::instrument(skip(self, routes, call), fields(tool = %call.name))]
    async fn call_tool(&self, routes: &RouteTable, call: ToolsCallParams) -> Result<ToolCallOutcome> {
        let (connector_id, tool) =
            parse_namespace(&call.name).ok_or_else(|| Error::InvalidNamespace(call.name.clone()))?;
        let connector = routes
            .find_connector(connector_id)
            .ok_or_else(|| Error::ConnectorNotFound(connector_id.to_string()))?;

        let budget = routes.call_timeout;
        let start = Instant::now();
        let outcome = tokio::time::timeout(
            budget,
            connector.backend.call_tool(tool, call.arguments, budget),
        )
        .await
        .map_err(|_| Error::BackendTimeout(format!("{} exceeded {budget:?}", call.name)))?;

        let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &outcome {
            Ok(_) => debug!(connector = %connector_id, latency_ms, "Call forwarded"),
            Err(e) => warn!(connector = %connector_id, latency_ms, error = %e, "Call failed"),
        }
        outcome
    }

    /// Re-read the configuration file and reconcile connectors
    pub async fn reload(&self) -> ReloadReport {
        match Config::load(self.config_path.as_deref()) {
            Ok(config) => self.apply_config(config).await,
            Err(e) => {
                warn!(error = %e, "Reload aborted; configuration unchanged");
                ReloadReport {
                    success: false,
                    message: Some(e.to_string()),
                    ..ReloadReport::default()
                }
            }
        }
    }

    /// Reconcile the live route table with `config`.
    ///
    /// Unchanged connectors keep their instance. Added and modified ones are
    /// connected in parallel; a modified connector that fails to reconnect
    /// keeps serving with its previous instance.
    pub async fn apply_config(&self, config: Config) -> ReloadReport {
        let _guard = self.reload_lock.lock().await;

        if let Err(e) = config.validate() {
            warn!(error = %e, "Reload aborted; configuration unchanged");
            return ReloadReport {
                success: false,
                message: Some(e.to_string()),
                ..ReloadReport::default()
            };
        }

        let current = self.routes();
        let patch = compute_diff(&current.config, &config);
        if patch.server_changed || patch.control_changed {
            warn!(changes = %patch.summary(), "Some changes need a restart to take effect");
        }
        info!(changes = %patch.summary(), "Reloading");

        let wanted: Vec<(String, BackendConfig)> = patch.to_connect().cloned().collect();
        let (mut fresh, mut failed) = connect_all(self.factory.as_ref(), &wanted).await;

        let mut connectors = Vec::new();
        let mut retired = Vec::new();
        for (id, _) in config.enabled_backends() {
            let previous = current.find_connector(id);
            match (fresh.remove(id), previous) {
                (Some(replacement), Some(old)) => {
                    retired.push(old.clone());
                    connectors.push(replacement);
                }
                (Some(added), None) => connectors.push(added),
                (None, Some(kept)) => connectors.push(kept.clone()),
                (None, None) => {}
            }
        }
        retired.extend(
            patch
                .backends_removed
                .iter()
                .filter_map(|id| current.find_connector(id).cloned()),
        );

        let mut reloaded: Vec<String> = wanted
            .iter()
            .map(|(id, _)| id.clone())
            .filter(|id| !failed.contains(id))
            .collect();
        reloaded.sort();
        failed.sort();

        let routes = match RouteTable::build(connectors, &config).await {
            Ok(routes) => routes,
            Err(e) => {
                warn!(error = %e, "Reload aborted; configuration unchanged");
                return ReloadReport {
                    success: false,
                    message: Some(e.to_string()),
                    ..ReloadReport::default()
                };
            }
        };
        let tool_count = routes.catalog.tools.len();
        *self.routes.write() = Arc::new(routes);

        let retired_count = retired.len();
        tokio::spawn(retire(current, retired, self.shutdown_timeout));

        let message = format!(
            "{}; {} connector(s) reloaded, {} failed, {retired_count} retired, {tool_count} tools",
            patch.summary(),
            reloaded.len(),
            failed.len(),
        );
        info!(%message, "Reload complete");
        ReloadReport {
            success: true,
            reloaded_connectors: reloaded,
            failed_connectors: failed,
            message: Some(message),
        }
    }

    /// Live state, built now
    #[must_use]
    pub fn snapshot(&self) -> RuntimeSnapshot {
        let routes = self.routes();
        RuntimeSnapshot {
            connectors: routes.connector_ids(),
            tool_count: routes.catalog.tools.len(),
            degraded_connectors: routes
                .catalog
                .warnings
                .iter()
                .map(|w| w.connector_id.clone())
                .collect(),
            in_flight: self.in_flight(),
            uptime_secs: self.started.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            started_at: self.started_at,
            routes_built_at: routes.built_at,
            control_endpoint: self.endpoint.to_string(),
        }
    }

    /// Stop accepting calls, wait up to `grace` for in-flight ones, then
    /// shut every backend down.
    pub async fn drain(&self, grace: Duration) {
        self.draining.store(true, Ordering::Release);
        let in_flight = self.in_flight();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight calls");
        }
        if tokio::time::timeout(grace, self.inflight.acquire_many(MAX_IN_FLIGHT))
            .await
            .is_err()
        {
            warn!(in_flight = self.in_flight(), "Drain window elapsed with calls still running");
        }

        let routes = self.routes();
        join_all(routes.connectors.iter().map(|c| async move {
            if let Err(e) = c.backend.shutdown().await {
                warn!(connector = %c.id, error = %e, "Backend shutdown failed");
            }
        }))
        .await;
        info!("All backends shut down");
    }

    /// Drain window from configuration
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }
}

#[async_trait]
impl ControlHandler for Dispatcher {
    async fn status(&self) -> RuntimeSnapshot {
        self.snapshot()
    }

    async fn reload(&self) -> ReloadReport {
        Dispatcher::reload(self).await
    }

    async fn stop(&self) {
        info!("Stop requested over the control channel");
        let _ = self.shutdown_tx.send(());
    }
}

/// Methods the gateway answers itself, before any permission check
fn answer_lifecycle(method: &str) -> Option<Result<Value>> {
    match method {
        "initialize" => {
            Some(serde_json::to_value(InitializeResult::gateway()).map_err(Error::from))
        }
        "ping" => Some(Ok(json!({}))),
        m if m.starts_with("notifications/") => Some(Ok(json!({}))),
        _ => None,
    }
}

fn handle_notification(notification: &JsonRpcNotification) {
    debug!(method = %notification.method, "Notification received");
}

fn parse_call_params(params: Option<Value>) -> Result<ToolsCallParams> {
    let params = params.ok_or_else(|| {
        Error::json_rpc(rpc_codes::INVALID_PARAMS, "tools/call requires params")
    })?;
    serde_json::from_value(params).map_err(|e| {
        Error::json_rpc(rpc_codes::INVALID_PARAMS, format!("Invalid tools/call params: {e}"))
    })
}

/// Connect `wanted` concurrently; returns the live connectors by id and the
/// ids that failed.
async fn connect_all(
    factory: &dyn ConnectorFactory,
    wanted: &[(String, BackendConfig)],
) -> (HashMap<String, Connector>, Vec<String>) {
    let attempts = join_all(wanted.iter().map(|(id, cfg)| async move {
        let attempt = tokio::time::timeout(cfg.timeout, factory.connect(id, cfg)).await;
        (id, cfg, attempt)
    }))
    .await;

    let mut connected = HashMap::new();
    let mut failed = Vec::new();
    for (id, cfg, attempt) in attempts {
        match attempt {
            Ok(Ok(backend)) => {
                connected.insert(id.clone(), Connector::new(id.clone(), cfg.clone(), backend));
            }
            Ok(Err(e)) => {
                warn!(connector = %id, error = %e, "Connect failed");
                failed.push(id.clone());
            }
            Err(_) => {
                warn!(connector = %id, timeout = ?cfg.timeout, "Connect timed out");
                failed.push(id.clone());
            }
        }
    }
    (connected, failed)
}

/// Shut down replaced and removed connectors once no call still holds the
/// table they were served from, or after `grace`.
async fn retire(previous: Arc<RouteTable>, retired: Vec<Connector>, grace: Duration) {
    if retired.is_empty() {
        return;
    }
    let released = Arc::clone(&previous.released);
    drop(previous);
    if tokio::time::timeout(grace, released.notified()).await.is_err() {
        warn!(?grace, "Calls still hold the previous route table; retiring anyway");
    }

    for connector in retired {
        debug!(connector = %connector.id, "Retiring connector");
        if let Err(e) = connector.backend.shutdown().await {
            warn!(connector = %connector.id, error = %e, "Backend shutdown failed");
        }
    }
}
