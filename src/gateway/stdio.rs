//! Stdio data plane: one JSON-RPC message per line in, one reply per line out

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use super::dispatcher::Dispatcher;
use crate::control::MAX_LINE_BYTES;
use crate::protocol::{Frame, LineFrames, RawMessage};
use crate::{Error, Result};

/// Serve lines from `input` until EOF or shutdown.
///
/// Calls run concurrently, so replies may come back out of order; callers
/// match them by id. Calls already started are answered before returning.
pub async fn serve_lines<R, W>(
    dispatcher: Arc<Dispatcher>,
    input: R,
    output: W,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = FramedRead::new(input, LineFrames::new(MAX_LINE_BYTES));
    let (tx, mut rx) = mpsc::channel::<String>(256);

    let writer = tokio::spawn(async move {
        let mut sink = FramedWrite::new(output, LineFrames::new(usize::MAX));
        while let Some(line) = rx.recv().await {
            sink.send(line)
                .await
                .map_err(|e| Error::Transport(format!("stdout write failed: {e}")))?;
        }
        Ok::<(), Error>(())
    });

    let mut calls = JoinSet::new();
    loop {
        let next = tokio::select! {
            next = lines.next() => next,
            _ = shutdown.recv() => break,
        };
        let line = match next {
            Some(Ok(Frame::Line(line))) => line,
            Some(Ok(Frame::Rejected(reason))) => {
                warn!(%reason, "Input line skipped");
                continue;
            }
            Some(Err(e)) => {
                warn!(error = %e, "Input read failed");
                break;
            }
            None => {
                debug!("Input closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let dispatcher = Arc::clone(&dispatcher);
        let tx = tx.clone();
        calls.spawn(async move {
            let Some(reply) = dispatcher.handle(RawMessage::inbound(line)).await else {
                return;
            };
            match serde_json::to_string(&reply) {
                Ok(text) => {
                    let _ = tx.send(text).await;
                }
                Err(e) => warn!(error = %e, "Reply could not be encoded"),
            }
        });
    }

    while calls.join_next().await.is_some() {}
    drop(tx);
    writer
        .await
        .map_err(|e| Error::Internal(format!("stdout writer panicked: {e}")))?
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value, json};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::backend::{ConnectorFactory, ToolBackend};
    use crate::config::{BackendConfig, Config};

    struct NoBackends;

    #[async_trait]
    impl ConnectorFactory for NoBackends {
        async fn connect(&self, id: &str, _: &BackendConfig) -> Result<Arc<dyn ToolBackend>> {
            Err(Error::Transport(format!("{id} unavailable")))
        }
    }

    #[tokio::test]
    async fn each_request_line_gets_one_reply_line() {
        let mut config = Config::default();
        config.control.socket_path = Some("/tmp/unused.sock".into());
        config.gateway.permissions = vec!["mcp:*".to_string()];
        let dispatcher = Dispatcher::start(config, Arc::new(NoBackends)).await.unwrap();

        let (mut client_in, server_in) = tokio::io::duplex(4096);
        let (server_out, client_out) = tokio::io::duplex(4096);
        let (_tx, rx) = broadcast::channel(1);
        let server = tokio::spawn(serve_lines(dispatcher, server_in, server_out, rx));

        client_in
            .write_all(
                concat!(
                    r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#, "\n",
                    "\n",
                    r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#, "\n",
                    r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#, "\n",
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        drop(client_in);

        let mut replies = Vec::new();
        let mut lines = BufReader::new(client_out).lines();
        while let Ok(Some(line)) =
            tokio::time::timeout(Duration::from_secs(2), lines.next_line()).await.unwrap()
        {
            replies.push(serde_json::from_str::<Value>(&line).unwrap());
        }
        server.await.unwrap().unwrap();

        replies.sort_by_key(|r| r["id"].as_i64());
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["result"], json!({}));
        assert_eq!(replies[1]["result"]["tools"], json!([]));
    }

    #[tokio::test]
    async fn bad_line_is_skipped_and_the_next_one_answered() {
        let mut config = Config::default();
        config.control.socket_path = Some("/tmp/unused.sock".into());
        config.gateway.permissions = vec!["mcp:*".to_string()];
        let dispatcher = Dispatcher::start(config, Arc::new(NoBackends)).await.unwrap();

        let (mut client_in, server_in) = tokio::io::duplex(4096);
        let (server_out, client_out) = tokio::io::duplex(4096);
        let (_tx, rx) = broadcast::channel(1);
        let server = tokio::spawn(serve_lines(dispatcher, server_in, server_out, rx));

        // Client stays connected: only the bad line may be lost.
        client_in.write_all(b"\xff\xfe garbage\n").await.unwrap();
        client_in
            .write_all(concat!(r#"{"jsonrpc":"2.0","id":5,"method":"ping"}"#, "\n").as_bytes())
            .await
            .unwrap();

        let mut lines = BufReader::new(client_out).lines();
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .expect("reply to ping");
        let reply: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["id"], 5);
        assert_eq!(reply["result"], json!({}));
        assert!(!server.is_finished());

        drop(client_in);
        server.await.unwrap().unwrap();
    }
}
