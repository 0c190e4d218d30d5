//! Scripted backends shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use mcp_hub::backend::{ConnectorFactory, ToolBackend, ToolCallOutcome, ToolListing};
use mcp_hub::config::BackendConfig;
use mcp_hub::protocol::{JsonRpcError, RawMessage, Tool};
use mcp_hub::{Error, Result};

/// How one scripted connector behaves
#[derive(Debug, Clone)]
pub struct Script {
    pub tools: Vec<String>,
    pub list_delay: Duration,
    pub call_delay: Duration,
}

impl Script {
    pub fn tools(names: &[&str]) -> Self {
        Self {
            tools: names.iter().map(ToString::to_string).collect(),
            list_delay: Duration::ZERO,
            call_delay: Duration::ZERO,
        }
    }
}

pub struct ScriptedBackend {
    pub id: String,
    pub script: Script,
    pub calls: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

#[async_trait]
impl ToolBackend for ScriptedBackend {
    async fn list_tools(&self, _timeout: Duration) -> Result<ToolListing> {
        tokio::time::sleep(self.script.list_delay).await;
        let tools = self
            .script
            .tools
            .iter()
            .map(|name| {
                serde_json::from_value::<Tool>(json!({
                    "name": name,
                    "description": format!("{name} from {}", self.id),
                    "inputSchema": { "type": "object" }
                }))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ToolListing { tools })
    }

    async fn call_tool(&self, name: &str, arguments: Value, _: Duration) -> Result<ToolCallOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.script.call_delay).await;
        if name == "explode" {
            return Ok(ToolCallOutcome::Error(JsonRpcError {
                code: -32099,
                message: format!("{} exploded", self.id),
                data: Some(json!({ "retry": false })),
            }));
        }
        Ok(ToolCallOutcome::Result(json!({
            "content": [{ "type": "text", "text": format!("{}:{name}", self.id) }],
            "arguments": arguments,
        })))
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connects ids that have a script; everything else is refused
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: Mutex<HashMap<String, Script>>,
    made: Mutex<Vec<Arc<ScriptedBackend>>>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, id: &str, script: Script) {
        self.scripts.lock().insert(id.to_string(), script);
    }

    pub fn refuse(&self, id: &str) {
        self.scripts.lock().remove(id);
    }

    /// Every backend built so far for `id`, oldest first
    pub fn instances(&self, id: &str) -> Vec<Arc<ScriptedBackend>> {
        self.made
            .lock()
            .iter()
            .filter(|b| b.id == id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ConnectorFactory for ScriptedFactory {
    async fn connect(&self, id: &str, _config: &BackendConfig) -> Result<Arc<dyn ToolBackend>> {
        let script = self
            .scripts
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("{id}: connection refused")))?;
        let backend = Arc::new(ScriptedBackend {
            id: id.to_string(),
            script,
            calls: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        });
        self.made.lock().push(Arc::clone(&backend));
        Ok(backend)
    }
}

/// Encode a JSON value as an inbound message
pub fn inbound(message: &Value) -> RawMessage {
    RawMessage::inbound(message.to_string())
}

/// Request `method` with `params` as id 1
pub fn request(method: &str, params: Value) -> RawMessage {
    inbound(&json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params }))
}
