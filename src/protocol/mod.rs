//! Wire protocol: JSON-RPC envelope, MCP payloads and family detection

mod adapter;
mod framing;
mod jsonrpc;
mod mcp;

pub use adapter::*;
pub use framing::{Frame, LineFrames, LineRejection};
pub use jsonrpc::*;
pub use mcp::*;

/// MCP protocol version the gateway speaks towards callers and backends
pub const PROTOCOL_VERSION: &str = "2025-06-18";
