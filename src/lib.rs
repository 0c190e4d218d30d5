//! MCP Hub Library
//!
//! A single endpoint in front of many MCP tool servers.
//!
//! # Features
//!
//! - **Protocol detection**: inbound messages are classified as MCP or A2A
//!   JSON-RPC before anything else touches them
//! - **Default-deny permissions**: every routed call is checked against
//!   `family:method[:target]` grants
//! - **Namespaced aggregation**: backend tools are advertised as
//!   `<connector>__<tool>` and collected concurrently, tolerating slow or
//!   failing backends
//! - **Hot reload**: connectors are rebuilt from the config file and the route
//!   table is swapped atomically, without interrupting calls in flight
//! - **Control plane**: `status`, `reload` and `stop` over a Unix socket or a
//!   Windows named pipe
//!
//! # Protocol Version
//!
//! Speaks MCP protocol version 2025-06-18 to clients and backends.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod cli;
pub mod config;
pub mod config_reload;
pub mod control;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod security;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging.
///
/// Logs always go to stderr; stdout belongs to the stdio data plane and to
/// the control subcommands' output.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))
}
