//! Control server: accept loop plus one task per connection

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::protocol::{ControlCommand, ControlKind, ControlMessage, ControlResponse};
use super::{ControlEndpoint, ControlHandler, MAX_LINE_BYTES};
use crate::protocol::{Frame, LineFrames};
use crate::{Error, Result};

/// Serves control requests until shutdown
pub struct ControlServer {
    endpoint: ControlEndpoint,
    handler: Arc<dyn ControlHandler>,
    /// Serializes `reload` and `stop`; `status` never takes it
    mutation: Arc<Mutex<()>>,
}

impl ControlServer {
    /// Create a server; nothing is bound until [`Self::run`]
    pub fn new(endpoint: ControlEndpoint, handler: Arc<dyn ControlHandler>) -> Self {
        Self {
            endpoint,
            handler,
            mutation: Arc::new(Mutex::new(())),
        }
    }

    /// Address this server listens on
    #[must_use]
    pub fn endpoint(&self) -> &ControlEndpoint {
        &self.endpoint
    }

    /// Accept connections until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be bound, or if a live
    /// gateway already owns it.
    pub async fn run(self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        match &self.endpoint {
            ControlEndpoint::Socket(path) => {
                let path = path.clone();
                self.serve_socket(&path, shutdown).await
            }
            ControlEndpoint::Pipe(name) => {
                let name = name.clone();
                self.serve_pipe(&name, shutdown).await
            }
        }
    }

    #[cfg(unix)]
    async fn serve_socket(
        &self,
        path: &std::path::Path,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let listener = bind_socket(path).await?;
        info!(endpoint = %self.endpoint, "Control server listening");

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.recv() => break,
            };
            match accepted {
                Ok((stream, _)) => self.spawn_connection(stream),
                Err(e) => warn!(error = %e, "Control accept failed"),
            }
        }

        let _ = tokio::fs::remove_file(path).await;
        debug!(endpoint = %self.endpoint, "Control server stopped");
        Ok(())
    }

    #[cfg(not(unix))]
    async fn serve_socket(
        &self,
        _path: &std::path::Path,
        _shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        Err(Error::Control(
            "Unix domain sockets are not available on this platform".to_string(),
        ))
    }

    #[cfg(windows)]
    async fn serve_pipe(&self, name: &str, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let mut server = ServerOptions::new().first_pipe_instance(true).create(name)?;
        info!(endpoint = %self.endpoint, "Control server listening");

        loop {
            let connected = tokio::select! {
                connected = server.connect() => connected,
                _ = shutdown.recv() => break,
            };
            if let Err(e) = connected {
                warn!(error = %e, "Control pipe connect failed");
                continue;
            }
            let client = std::mem::replace(&mut server, ServerOptions::new().create(name)?);
            self.spawn_connection(client);
        }

        debug!(endpoint = %self.endpoint, "Control server stopped");
        Ok(())
    }

    #[cfg(not(windows))]
    async fn serve_pipe(&self, _name: &str, _shutdown: broadcast::Receiver<()>) -> Result<()> {
        Err(Error::Control(
            "Named pipes are not available on this platform".to_string(),
        ))
    }

    fn spawn_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        let mutation = Arc::clone(&self.mutation);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, handler, mutation).await {
                debug!(error = %e, "Control connection closed with error");
            }
        });
    }
}

/// Bind the socket, clearing a stale file left by a dead gateway
#[cfg(unix)]
async fn bind_socket(path: &std::path::Path) -> Result<tokio::net::UnixListener> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if path.exists() {
        if tokio::net::UnixStream::connect(path).await.is_ok() {
            return Err(Error::Control(format!(
                "Another gateway is already listening on {}",
                path.display()
            )));
        }
        debug!(path = %path.display(), "Removing stale control socket");
        tokio::fs::remove_file(path).await?;
    }

    let listener = tokio::net::UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// Serve one client until it hangs up or asks the gateway to stop
async fn handle_connection<S>(
    stream: S,
    handler: Arc<dyn ControlHandler>,
    mutation: Arc<Mutex<()>>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LineFrames::new(MAX_LINE_BYTES));

    while let Some(frame) = framed.next().await {
        let frame = frame.map_err(|e| Error::Control(e.to_string()))?;
        let (reply, stop_guard) = match frame {
            Frame::Line(line) if line.trim().is_empty() => continue,
            Frame::Line(line) => respond(&line, handler.as_ref(), &mutation).await,
            Frame::Rejected(reason) => {
                warn!(%reason, "Malformed control request");
                let reply = ControlResponse::error(format!("Malformed control request: {reason}"));
                (ControlMessage::response(String::new(), reply), None)
            }
        };
        framed
            .send(serde_json::to_string(&reply)?)
            .await
            .map_err(|e| Error::Control(e.to_string()))?;

        if let Some(guard) = stop_guard {
            // Acknowledged and flushed; now the gateway may go away.
            handler.stop().await;
            drop(guard);
            break;
        }
    }
    Ok(())
}

/// Build the reply to one line. For `stop` the mutation guard is handed
/// back so it stays held until the acknowledgement is on the wire.
async fn respond(
    line: &str,
    handler: &dyn ControlHandler,
    mutation: &Arc<Mutex<()>>,
) -> (ControlMessage, Option<OwnedMutexGuard<()>>) {
    let request: ControlMessage = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed control request");
            let reply = ControlResponse::error(format!("Malformed control request: {e}"));
            return (ControlMessage::response(salvage_id(line), reply), None);
        }
    };

    let id = request.id;
    let command = match (request.kind, request.command) {
        (ControlKind::Request, Some(command)) => command,
        (ControlKind::Response, _) => {
            let reply = ControlResponse::error("Expected a request, got a response");
            return (ControlMessage::response(id, reply), None);
        }
        (ControlKind::Request, None) => {
            let reply = ControlResponse::error("Request has no command");
            return (ControlMessage::response(id, reply), None);
        }
    };
    info!(%id, command = command.as_str(), "Control command received");

    match command {
        ControlCommand::Status => {
            let snapshot = handler.status().await;
            (ControlMessage::response(id, ControlResponse::Status { snapshot }), None)
        }
        ControlCommand::Reload => {
            let _guard = mutation.lock().await;
            let report = handler.reload().await;
            let reply = ControlResponse::Ok {
                message: report.message.clone(),
                reload: Some(report),
            };
            (ControlMessage::response(id, reply), None)
        }
        ControlCommand::Stop => {
            let guard = Arc::clone(mutation).lock_owned().await;
            (
                ControlMessage::response(id, ControlResponse::ok("stopping")),
                Some(guard),
            )
        }
    }
}

/// Best-effort id from a line that failed to decode as a control message
fn salvage_id(line: &str) -> String {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("id")?.as_str().map(str::to_string))
        .unwrap_or_default()
}
