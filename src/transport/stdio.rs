//! Stdio transport: a backend subprocess speaking newline-delimited JSON-RPC

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use super::Transport;
use crate::protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId,
};
use crate::{Error, Result};

/// Stdio transport for subprocess backends
pub struct StdioTransport {
    /// Connector id, for logs
    name: String,
    /// Command line, split with shell quoting rules
    command: String,
    /// Extra environment
    env: HashMap<String, String>,
    /// Working directory
    cwd: Option<String>,
    /// Per-request budget
    timeout: Duration,
    child: Mutex<Option<Child>>,
    writer: Mutex<Option<ChildStdin>>,
    /// Requests awaiting a response line, keyed by id
    pending: DashMap<String, oneshot::Sender<JsonRpcResponse>>,
    next_id: AtomicI64,
    connected: AtomicBool,
}

impl StdioTransport {
    /// Create a transport; nothing is spawned until [`Self::start`]
    #[must_use]
    pub fn new(
        name: &str,
        command: &str,
        env: HashMap<String, String>,
        cwd: Option<String>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            command: command.to_string(),
            env,
            cwd,
            timeout,
            child: Mutex::new(None),
            writer: Mutex::new(None),
            pending: DashMap::new(),
            next_id: AtomicI64::new(1),
            connected: AtomicBool::new(false),
        })
    }

    /// Spawn the subprocess and run the MCP initialize handshake
    ///
    /// # Errors
    ///
    /// Returns an error if the command is empty, cannot be spawned, or the
    /// handshake fails.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let parts = shlex::split(&self.command)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::Config(format!("Unparsable command: {}", self.command)))?;
        let (program, args) = parts
            .split_first()
            .ok_or_else(|| Error::Config("Empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Transport(format!("Failed to spawn '{program}': {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("Failed to get stdout".to_string()))?;

        *self.writer.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                transport.handle_line(&line);
            }
            transport.connected.store(false, Ordering::Relaxed);
            // Dropping the senders wakes every waiter with a closed channel.
            transport.pending.clear();
            debug!(backend = %transport.name, "Stdio reader task ended");
        });

        self.initialize().await
    }

    async fn initialize(&self) -> Result<()> {
        let response = self
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "mcp-hub",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                })),
            )
            .await?;

        if let Some(err) = response.error {
            return Err(Error::Protocol(format!(
                "Initialize failed: {} ({})",
                err.message, err.code
            )));
        }

        self.notify("notifications/initialized", None).await?;
        self.connected.store(true, Ordering::Relaxed);
        debug!(backend = %self.name, command = %self.command, "Stdio transport initialized");
        Ok(())
    }

    /// Route one stdout line to the request waiting for it
    fn handle_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let response: JsonRpcResponse = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                // Backends may emit server->client requests or logs on stdout.
                debug!(backend = %self.name, error = %e, "Ignoring non-response line");
                return;
            }
        };
        let Some(id) = response.id.as_ref().map(ToString::to_string) else {
            return;
        };
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(response);
            }
            None => warn!(backend = %self.name, %id, "Response for unknown request id"),
        }
    }

    async fn write_line(&self, message: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let stdin = writer
            .as_mut()
            .ok_or_else(|| Error::Transport("Not connected".to_string()))?;
        let io = |e: std::io::Error| Error::Transport(e.to_string());
        stdin.write_all(message.as_bytes()).await.map_err(io)?;
        stdin.write_all(b"\n").await.map_err(io)?;
        stdin.flush().await.map_err(io)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let key = id.to_string();
        let request = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);

        let message = serde_json::to_string(&request)?;
        if let Err(e) = self.write_line(&message).await {
            self.pending.remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Transport(format!(
                "Backend '{}' closed before answering {method}",
                self.name
            ))),
            Err(_) => {
                self.pending.remove(&key);
                Err(Error::BackendTimeout(format!(
                    "{} did not answer {method} within {:?}",
                    self.name, self.timeout
                )))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        self.write_line(&serde_json::to_string(&notification)?).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        *self.writer.lock().await = None;
        if let Some(ref mut child) = *self.child.lock().await {
            let _ = child.kill().await;
        }
        Ok(())
    }
}
