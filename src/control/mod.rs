//! Control plane: `reload`, `stop` and `status` over a local channel
//!
//! The gateway runs a [`ControlServer`] next to its data plane; the CLI's
//! management subcommands talk to it through a [`ControlClient`]. Messages
//! are newline-delimited JSON (see [`protocol`]).

mod client;
mod endpoint;
pub mod protocol;
mod server;

pub use client::ControlClient;
pub use endpoint::{CONTROL_DIR, ControlEndpoint, SOCKET_FILE, socket_path_for};
pub use protocol::{
    ControlCommand, ControlKind, ControlMessage, ControlResponse, ReloadReport, RuntimeSnapshot,
    new_request_id,
};
pub use server::ControlServer;

use async_trait::async_trait;

/// Longest accepted control line
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// What the control server asks of the gateway
#[async_trait]
pub trait ControlHandler: Send + Sync {
    /// Live state; never fails
    async fn status(&self) -> RuntimeSnapshot;

    /// Re-read configuration and reconcile connectors
    async fn reload(&self) -> ReloadReport;

    /// Begin shutdown. Called after the acknowledgement has been flushed.
    async fn stop(&self);
}
