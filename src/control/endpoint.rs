//! Where the control server listens
//!
//! Unix: a domain socket at `<config dir>/.mcp-hub/control.sock`, unless
//! `control.socket_path` overrides it. Windows: the named pipe from
//! `control.pipe_name`.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Directory created next to the configuration file
pub const CONTROL_DIR: &str = ".mcp-hub";

/// Socket file name inside [`CONTROL_DIR`]
pub const SOCKET_FILE: &str = "control.sock";

/// Local control channel address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEndpoint {
    /// Unix domain socket
    Socket(PathBuf),
    /// Windows named pipe
    Pipe(String),
}

impl ControlEndpoint {
    /// Endpoint for this platform and configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        if cfg!(windows) {
            return Self::Pipe(config.control.pipe_name.clone());
        }
        let path = config
            .control
            .socket_path
            .clone()
            .unwrap_or_else(|| socket_path_for(&config.base_dir()));
        Self::Socket(path)
    }

    /// Socket path, if this is a socket endpoint
    #[must_use]
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Self::Socket(path) => Some(path),
            Self::Pipe(_) => None,
        }
    }
}

impl fmt::Display for ControlEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(path) => write!(f, "unix:{}", path.display()),
            Self::Pipe(name) => write!(f, "pipe:{name}"),
        }
    }
}

/// `<base>/.mcp-hub/control.sock`
#[must_use]
pub fn socket_path_for(base: &Path) -> PathBuf {
    base.join(CONTROL_DIR).join(SOCKET_FILE)
}
