//! HTTP transport: Streamable HTTP, or the SSE endpoint handshake
//!
//! SSE mode opens `GET <url>` and waits for the `endpoint` event naming the
//! URL that accepts POSTed messages. Streamable HTTP posts straight to the
//! configured URL. Either way, responses may come back as plain JSON or as a
//! single `data:` line of an event stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, header};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use url::Url;

use super::Transport;
use crate::protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId,
};
use crate::{Error, Result};

const SESSION_HEADER: &str = "MCP-Session-Id";
const VERSION_HEADER: &str = "MCP-Protocol-Version";

/// HTTP transport for remote backends
pub struct HttpTransport {
    name: String,
    client: Client,
    base_url: String,
    /// Where messages are POSTed; set by [`Self::initialize`]
    message_url: RwLock<Option<String>>,
    headers: HashMap<String, String>,
    session_id: RwLock<Option<String>>,
    next_id: AtomicI64,
    connected: AtomicBool,
    streamable_http: bool,
}

impl HttpTransport {
    /// Build the client; no network traffic happens here
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the HTTP client cannot be built.
    pub fn new(
        name: &str,
        url: &str,
        headers: HashMap<String, String>,
        timeout: Duration,
        streamable_http: bool,
    ) -> Result<Arc<Self>> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(Arc::new(Self {
            name: name.to_string(),
            client,
            base_url: url.to_string(),
            message_url: RwLock::new(None),
            headers,
            session_id: RwLock::new(None),
            next_id: AtomicI64::new(1),
            connected: AtomicBool::new(false),
            streamable_http,
        }))
    }

    /// Resolve the message endpoint and run the MCP initialize handshake
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be resolved or initialize fails.
    pub async fn initialize(&self) -> Result<()> {
        let message_url = if self.streamable_http {
            self.base_url.clone()
        } else {
            let endpoint = self.sse_endpoint().await?;
            resolve_endpoint(&self.base_url, &endpoint)?
        };
        info!(backend = %self.name, url = %message_url, streamable = self.streamable_http, "HTTP message endpoint resolved");
        *self.message_url.write() = Some(message_url);

        let request = JsonRpcRequest::new(
            RequestId::Number(0),
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": "mcp-hub", "version": env!("CARGO_PKG_VERSION") }
            })),
        );
        let response = self.post(&request).await?;
        if let Some(err) = response.error {
            return Err(Error::Protocol(format!(
                "Initialize failed: {} ({})",
                err.message, err.code
            )));
        }

        self.notify("notifications/initialized", None).await?;
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Read the SSE stream until the `endpoint` event arrives
    async fn sse_endpoint(&self) -> Result<String> {
        let response = self
            .with_headers(self.client.get(&self.base_url))
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::Transport(format!("SSE connection failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("SSE endpoint returned: {status}")));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut event: Option<String> = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Transport(format!("SSE read failed: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                let line = line.trim();
                if line.is_empty() {
                    event = None;
                } else if let Some(name) = line.strip_prefix("event:") {
                    event = Some(name.trim().to_string());
                } else if let Some(data) = line.strip_prefix("data:") {
                    if event.as_deref() == Some("endpoint") {
                        return Ok(data.trim().to_string());
                    }
                }
            }
        }

        Err(Error::Transport(
            "SSE stream ended without an endpoint event".to_string(),
        ))
    }

    fn with_headers(&self, mut builder: RequestBuilder) -> RequestBuilder {
        builder = builder.header(VERSION_HEADER, PROTOCOL_VERSION);
        if let Some(ref session) = *self.session_id.read() {
            builder = builder.header(SESSION_HEADER, session.as_str());
        }
        for (key, value) in &self.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        builder
    }

    fn message_url(&self) -> String {
        self.message_url
            .read()
            .clone()
            .unwrap_or_else(|| self.base_url.clone())
    }

    async fn post(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let url = self.message_url();
        let response = self
            .with_headers(self.client.post(&url))
            .header(header::ACCEPT, "application/json, text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::BackendTimeout(format!("{}: {e}", self.name))
                } else {
                    Error::Transport(format!("Request failed: {e}"))
                }
            })?;

        if self.session_id.read().is_none() {
            if let Some(id) = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                debug!(backend = %self.name, session_id = %id, "Stored session id");
                *self.session_id.write() = Some(id.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!("HTTP {status}: {body}")));
        }

        let is_event_stream = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));
        let text = response.text().await?;

        if is_event_stream {
            let data = text
                .lines()
                .find_map(|l| l.strip_prefix("data:"))
                .ok_or_else(|| Error::Transport("No data in SSE response".to_string()))?;
            Ok(serde_json::from_str(data.trim())?)
        } else {
            Ok(serde_json::from_str(&text)?)
        }
    }
}

/// Absolute endpoints are used as-is; relative ones resolve against `base`.
fn resolve_endpoint(base: &str, endpoint: &str) -> Result<String> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return Ok(endpoint.to_string());
    }
    Url::parse(base)
        .and_then(|b| b.join(endpoint))
        .map(String::from)
        .map_err(|e| Error::Transport(format!("Invalid endpoint '{endpoint}': {e}")))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.post(&JsonRpcRequest::new(id, method, params)).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        let url = self.message_url();
        let response = self
            .with_headers(self.client.post(&url))
            .json(&notification)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Notification failed: {e}")))?;
        if !response.status().is_success() {
            warn!(backend = %self.name, status = %response.status(), "Notification rejected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        let session = self.session_id.read().clone();
        if let Some(id) = session {
            let _ = self
                .client
                .delete(self.message_url())
                .header(SESSION_HEADER, id)
                .send()
                .await;
        }
        Ok(())
    }
}
