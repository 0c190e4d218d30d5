//! Error types for the gateway

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// An adapter claimed the message but its body could not be decoded
    #[error("Parse error ({protocol}): {message}")]
    Parse {
        /// Protocol family that claimed the message
        protocol: String,
        /// Decoder message
        message: String,
    },

    /// Default-deny outcome of the permission engine
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Namespaced tool name could not be split
    #[error("Invalid namespaced tool name: {0}")]
    InvalidNamespace(String),

    /// Connector id not present in the live route table
    #[error("Connector not found: {0}")]
    ConnectorNotFound(String),

    /// Backend did not answer within the call budget
    #[error("Backend timeout: {0}")]
    BackendTimeout(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC error (relayed from a backend or produced locally)
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
        /// Optional data
        data: Option<serde_json::Value>,
    },

    /// Control channel could not be reached or broke mid-exchange
    #[error("Control channel error: {0}")]
    Control(String),

    /// No matching control response within the round-trip window
    #[error("Control request {id} timed out after {timeout:?}")]
    ControlTimeout {
        /// Correlation id of the request
        id: String,
        /// Window that elapsed
        timeout: Duration,
    },

    /// The gateway answered a control request with `{type: "error"}`
    #[error("Control request rejected: {0}")]
    ControlRejected(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a JSON-RPC error
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Parse { .. } | Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::Protocol(_) => rpc_codes::INVALID_REQUEST,
            Self::InvalidNamespace(_) => rpc_codes::INVALID_PARAMS,
            Self::PermissionDenied(_) => rpc_codes::PERMISSION_DENIED,
            Self::ConnectorNotFound(_) => rpc_codes::CONNECTOR_NOT_FOUND,
            Self::BackendTimeout(_) | Self::Transport(_) | Self::Http(_) => {
                rpc_codes::BACKEND_ERROR
            }
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// `true` for the authorization outcome, so callers can branch on it
    #[must_use]
    pub fn is_denial(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }

    /// `true` for namespace and connector lookup failures
    #[must_use]
    pub fn is_addressing(&self) -> bool {
        matches!(self, Self::InvalidNamespace(_) | Self::ConnectorNotFound(_))
    }
}

/// Standard JSON-RPC error codes plus the gateway's server-range codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Backend failure or timeout
    pub const BACKEND_ERROR: i32 = -32000;
    /// Connector id unknown to the route table
    pub const CONNECTOR_NOT_FOUND: i32 = -32001;
    /// Capability check failed
    pub const PERMISSION_DENIED: i32 = -32003;
    /// Server error range start
    pub const SERVER_ERROR_START: i32 = -32000;
    /// Server error range end
    pub const SERVER_ERROR_END: i32 = -32099;
}
