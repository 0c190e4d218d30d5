//! Control client used by the `status`, `reload` and `stop` subcommands

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

use super::protocol::{
    ControlCommand, ControlKind, ControlMessage, ControlResponse, ReloadReport, RuntimeSnapshot,
};
use super::{ControlEndpoint, MAX_LINE_BYTES};
use crate::{Error, Result};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Requests awaiting their response, keyed by correlation id
type PendingTable = DashMap<String, oneshot::Sender<ControlResponse>>;

/// One connection to a running gateway's control server
pub struct ControlClient {
    writer: Mutex<FramedWrite<BoxedWriter, LinesCodec>>,
    pending: Arc<PendingTable>,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ControlClient {
    /// Connect to `endpoint`; `timeout` bounds the connect and every round trip
    ///
    /// # Errors
    ///
    /// Returns `Error::Control` if no gateway is listening there.
    pub async fn connect(endpoint: &ControlEndpoint, timeout: Duration) -> Result<Self> {
        match endpoint {
            ControlEndpoint::Socket(path) => connect_socket(path, timeout).await,
            ControlEndpoint::Pipe(name) => connect_pipe(name, timeout).await,
        }
    }

    /// Wrap an already connected stream
    pub fn from_stream<S>(stream: S, timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let pending: Arc<PendingTable> = Arc::new(DashMap::new());

        let table = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
            while let Some(Ok(line)) = lines.next().await {
                resolve(&table, &line);
            }
            // Dropped senders wake every waiter.
            table.clear();
        });

        let writer: BoxedWriter = Box::new(write);
        Self {
            writer: Mutex::new(FramedWrite::new(writer, LinesCodec::new())),
            pending,
            timeout,
            reader,
        }
    }

    /// Send `command` and wait for the response carrying the same id.
    ///
    /// # Errors
    ///
    /// - `Error::ControlTimeout` when nothing arrives within the window
    /// - `Error::ControlRejected` when the gateway answers `{type: "error"}`
    /// - `Error::Control` when the connection breaks
    pub async fn request(&self, command: ControlCommand) -> Result<ControlResponse> {
        let message = ControlMessage::request(command);
        let id = message.id.clone();
        let line = serde_json::to_string(&message)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let sent = self.writer.lock().await.send(line).await;
        if let Err(e) = sent {
            self.pending.remove(&id);
            return Err(Error::Control(format!("Failed to send {}: {e}", command.as_str())));
        }
        debug!(%id, command = command.as_str(), "Control request sent");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(ControlResponse::Error { message })) => Err(Error::ControlRejected(message)),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Control(
                "Connection closed before a response arrived".to_string(),
            )),
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::ControlTimeout {
                    id,
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Fetch the runtime snapshot
    ///
    /// # Errors
    ///
    /// See [`Self::request`].
    pub async fn status(&self) -> Result<RuntimeSnapshot> {
        match self.request(ControlCommand::Status).await? {
            ControlResponse::Status { snapshot } => Ok(snapshot),
            other => Err(unexpected(&other)),
        }
    }

    /// Ask the gateway to reload its configuration
    ///
    /// # Errors
    ///
    /// See [`Self::request`].
    pub async fn reload(&self) -> Result<ReloadReport> {
        match self.request(ControlCommand::Reload).await? {
            ControlResponse::Ok {
                reload: Some(report),
                ..
            } => Ok(report),
            other => Err(unexpected(&other)),
        }
    }

    /// Ask the gateway to drain and exit; returns the acknowledgement text
    ///
    /// # Errors
    ///
    /// See [`Self::request`].
    pub async fn stop(&self) -> Result<Option<String>> {
        match self.request(ControlCommand::Stop).await? {
            ControlResponse::Ok { message, .. } => Ok(message),
            other => Err(unexpected(&other)),
        }
    }

    /// Requests still waiting for an answer
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Deliver one response line to its waiter
fn resolve(pending: &PendingTable, line: &str) {
    let message: ControlMessage = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Unreadable control response");
            return;
        }
    };
    if message.kind != ControlKind::Response {
        return;
    }
    let Some(response) = message.response else {
        return;
    };
    match pending.remove(&message.id) {
        Some((_, tx)) => {
            let _ = tx.send(response);
        }
        None => debug!(id = %message.id, "Response for unknown or expired request"),
    }
}

fn unexpected(response: &ControlResponse) -> Error {
    Error::Control(format!("Unexpected control response: {response:?}"))
}

#[cfg(unix)]
async fn connect_socket(path: &std::path::Path, timeout: Duration) -> Result<ControlClient> {
    let stream = tokio::time::timeout(timeout, tokio::net::UnixStream::connect(path))
        .await
        .map_err(|_| Error::Control(format!("Timed out connecting to {}", path.display())))?
        .map_err(|e| {
            Error::Control(format!(
                "No gateway listening on {} ({e})",
                path.display()
            ))
        })?;
    Ok(ControlClient::from_stream(stream, timeout))
}

#[cfg(not(unix))]
async fn connect_socket(_path: &std::path::Path, _timeout: Duration) -> Result<ControlClient> {
    Err(Error::Control(
        "Unix domain sockets are not available on this platform".to_string(),
    ))
}

#[cfg(windows)]
async fn connect_pipe(name: &str, timeout: Duration) -> Result<ControlClient> {
    use tokio::net::windows::named_pipe::ClientOptions;

    const ERROR_PIPE_BUSY: i32 = 231;
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match ClientOptions::new().open(name) {
            Ok(client) => return Ok(ControlClient::from_stream(client, timeout)),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::Control(format!("Pipe {name} stayed busy")));
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => {
                return Err(Error::Control(format!(
                    "No gateway listening on {name} ({e})"
                )));
            }
        }
    }
}

#[cfg(not(windows))]
async fn connect_pipe(_name: &str, _timeout: Duration) -> Result<ControlClient> {
    Err(Error::Control(
        "Named pipes are not available on this platform".to_string(),
    ))
}
