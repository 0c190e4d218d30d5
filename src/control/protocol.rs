//! Control-plane wire format
//!
//! One JSON object per line. A request carries `command`, a response carries
//! `response`, and both share the correlation `id`:
//!
//! ```text
//! {"id":"18f3a2b4c5d-3f2a9c1e","kind":"request","command":{"type":"status"}}
//! {"id":"18f3a2b4c5d-3f2a9c1e","kind":"response","response":{"type":"status","snapshot":{...}}}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request or response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    /// Client to gateway
    Request,
    /// Gateway to client
    Response,
}

/// Management command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlCommand {
    /// Re-read configuration and reconcile connectors
    Reload,
    /// Drain and exit
    Stop,
    /// Report the runtime snapshot
    Status,
}

impl ControlCommand {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reload => "reload",
            Self::Stop => "stop",
            Self::Status => "status",
        }
    }
}

/// Gateway answer to a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlResponse {
    /// Command accepted
    Ok {
        /// Free-form detail
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Present for `reload`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reload: Option<ReloadReport>,
    },
    /// Command refused or malformed
    Error {
        /// Why
        message: String,
    },
    /// Answer to `status`
    Status {
        /// Live state at the time of the request
        snapshot: RuntimeSnapshot,
    },
}

impl ControlResponse {
    /// Plain acknowledgement
    pub fn ok(message: impl Into<String>) -> Self {
        Self::Ok {
            message: Some(message.into()),
            reload: None,
        }
    }

    /// Rejection with a reason
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Envelope for both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Correlation id; a response repeats its request's id
    pub id: String,
    /// Direction
    pub kind: ControlKind,
    /// Set on requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<ControlCommand>,
    /// Set on responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ControlResponse>,
}

impl ControlMessage {
    /// A request with a fresh id
    #[must_use]
    pub fn request(command: ControlCommand) -> Self {
        Self {
            id: new_request_id(),
            kind: ControlKind::Request,
            command: Some(command),
            response: None,
        }
    }

    /// The response to request `id`
    pub fn response(id: impl Into<String>, response: ControlResponse) -> Self {
        Self {
            id: id.into(),
            kind: ControlKind::Response,
            command: None,
            response: Some(response),
        }
    }
}

/// Outcome of a `reload`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadReport {
    /// The configuration was read and the route table swapped
    pub success: bool,
    /// Connectors brought up by this reload, in id order
    pub reloaded_connectors: Vec<String>,
    /// Connectors that failed to come up, in id order
    pub failed_connectors: Vec<String>,
    /// Summary for humans
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Live gateway state, built per request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    /// Active connector ids
    pub connectors: Vec<String>,
    /// Tools in the aggregated catalog
    pub tool_count: usize,
    /// Connectors left out of the catalog at the last rebuild
    #[serde(default)]
    pub degraded_connectors: Vec<String>,
    /// Calls currently being served
    #[serde(default)]
    pub in_flight: usize,
    /// Seconds since start
    pub uptime_secs: u64,
    /// Gateway version
    pub version: String,
    /// Process id
    pub pid: u32,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// When the current route table was built
    pub routes_built_at: DateTime<Utc>,
    /// Where the control server listens
    pub control_endpoint: String,
}

/// `<unix millis, hex>-<8 hex chars>`
#[must_use]
pub fn new_request_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis:x}-{}", &suffix[..8])
}
