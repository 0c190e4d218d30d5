//! Wire channels to backend MCP servers
//!
//! A transport only moves JSON-RPC frames; the MCP semantics live in
//! [`crate::backend::McpBackend`].

mod http;
mod stdio;

pub use self::http::HttpTransport;
pub use self::stdio::StdioTransport;

use async_trait::async_trait;
use serde_json::Value;

use crate::{Error, Result, protocol::JsonRpcResponse};

/// One JSON-RPC channel to a backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the response with the same id
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse>;

    /// Fire-and-forget notification
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Handshake completed and the channel has not been closed since
    fn is_connected(&self) -> bool;

    /// Tear the channel down; pending requests fail
    async fn close(&self) -> Result<()>;

    /// [`Self::request`], with a JSON-RPC error turned into `Error::JsonRpc`
    /// and a missing `result` read as `null`
    async fn request_result(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let response = self.request(method, params).await?;
        match response.error {
            Some(err) => Err(Error::JsonRpc {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }
}
