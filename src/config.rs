//! Configuration management

use std::{
    collections::{BTreeMap, HashMap},
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::gateway::SEPARATOR;
use crate::security::is_valid_grant;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// HTTP data-plane server
    pub server: ServerConfig,
    /// Routing, authorization and backend time budgets
    pub gateway: GatewayConfig,
    /// Control-plane channel
    pub control: ControlConfig,
    /// Backend connectors keyed by connector id
    pub backends: BTreeMap<String, BackendConfig>,
    /// File this configuration was loaded from (not serialized)
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // MCP_HUB_GATEWAY__CALL_TIMEOUT=10s style overrides
        figment = figment.merge(Env::prefixed("MCP_HUB_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.source = path.map(Path::to_path_buf);

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Reject configurations the router cannot serve.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        for id in self.backends.keys() {
            if id.is_empty() {
                return Err(Error::Config("Backend id must not be empty".to_string()));
            }
            if id.contains(SEPARATOR) {
                return Err(Error::Config(format!(
                    "Backend id '{id}' must not contain the namespace separator '{SEPARATOR}'"
                )));
            }
        }
        if let Some(bad) = self.gateway.permissions.iter().find(|g| !is_valid_grant(g)) {
            return Err(Error::Config(format!("Invalid permission grant '{bad}'")));
        }
        Ok(())
    }

    /// Directory the control endpoint is derived from: the config file's
    /// directory, or the working directory when no file was given.
    #[must_use]
    pub fn base_dir(&self) -> PathBuf {
        self.source
            .as_deref()
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .or_else(|| env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Enabled backends in id order
    pub fn enabled_backends(&self) -> impl Iterator<Item = (&String, &BackendConfig)> {
        self.backends.iter().filter(|(_, b)| b.enabled)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = match (path_str.strip_prefix('~'), dirs::home_dir()) {
                (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
                _ => path_str.clone(),
            };

            let path = Path::new(&expanded);
            if !path.exists() {
                tracing::debug!("Env file not found (skipped): {expanded}");
                continue;
            }
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} in backend headers and env
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("static regex");

        for backend in self.backends.values_mut() {
            for value in backend.headers.values_mut() {
                *value = expand_string(&re, value);
            }
            for value in backend.env.values_mut() {
                *value = expand_string(&re, value);
            }
        }
    }
}

fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// HTTP data-plane server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Serve the HTTP data plane at all
    pub enabled: bool,
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// How long `stop` waits for in-flight calls to drain
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 39500,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Routing and authorization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Granted permissions. Empty means every routed call is denied.
    pub permissions: Vec<String>,
    /// Budget for one backend's tool listing
    #[serde(with = "humantime_serde")]
    pub list_timeout: Duration,
    /// Budget for one forwarded tool call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            permissions: Vec::new(),
            list_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Control-plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Run the control server alongside the data plane
    pub enabled: bool,
    /// Explicit socket path (Unix); derived from the config directory when unset
    pub socket_path: Option<PathBuf>,
    /// Pipe name (Windows)
    pub pipe_name: String,
    /// Round-trip budget for one control request
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: None,
            pipe_name: r"\\.\pipe\mcp-hub-control".to_string(),
            timeout: Duration::from_millis(5000),
        }
    }
}

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Human-readable description
    pub description: String,
    /// Whether backend is enabled
    pub enabled: bool,
    /// Transport descriptor
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Per-request transport timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Environment variables (for stdio)
    pub env: HashMap<String, String>,
    /// HTTP headers (for http/sse)
    pub headers: HashMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            description: String::new(),
            enabled: true,
            transport: TransportConfig::default(),
            timeout: Duration::from_secs(30),
            env: HashMap::new(),
            headers: HashMap::new(),
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportConfig {
    /// Stdio transport (subprocess)
    Stdio {
        /// Command line to execute
        command: String,
        /// Working directory
        #[serde(default)]
        cwd: Option<String>,
    },
    /// HTTP transport
    Http {
        /// HTTP URL
        http_url: String,
        /// Use Streamable HTTP (direct POST, no SSE handshake)
        #[serde(default)]
        streamable_http: bool,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Http {
            http_url: String::new(),
            streamable_http: false,
        }
    }
}

impl TransportConfig {
    /// Get transport type name
    #[must_use]
    pub fn transport_type(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http {
                streamable_http: true,
                ..
            } => "streamable-http",
            Self::Http { http_url, .. } if http_url.ends_with("/sse") => "sse",
            Self::Http { .. } => "http",
        }
    }
}

/// Serde helpers for human-readable durations ("30s", "5m", "100ms")
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize as whole milliseconds, e.g. "1500ms"
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    /// Deserialize "30s", "5m", "100ms" or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(&s).map_err(serde::de::Error::custom),
        }
    }

    /// Parse a duration string
    ///
    /// # Errors
    ///
    /// Returns the integer parse error for malformed input.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" must be checked before "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_default_deny_with_bounded_timeouts() {
        let config = Config::default();
        assert!(config.gateway.permissions.is_empty());
        assert_eq!(config.gateway.list_timeout, Duration::from_secs(30));
        assert_eq!(config.control.timeout, Duration::from_millis(5000));
        assert!(config.control.enabled);
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
gateway:
  permissions: ["mcp:tools:*"]
  call_timeout: 2s
backends:
  weather:
    command: "weather-mcp --stdio"
  search:
    http_url: "http://localhost:9000/mcp"
    streamable_http: true
"#
        )
        .unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();

        assert_eq!(config.gateway.permissions, vec!["mcp:tools:*"]);
        assert_eq!(config.gateway.call_timeout, Duration::from_secs(2));
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends["weather"].transport.transport_type(), "stdio");
        assert_eq!(
            config.backends["search"].transport.transport_type(),
            "streamable-http"
        );
        assert_eq!(config.base_dir(), dir.path());
    }

    #[test]
    fn backend_transport_is_flattened() {
        let yaml = r#"
description: "Local files"
command: "fs-mcp --root /srv"
cwd: /srv
timeout: 500ms
env:
  TOKEN: abc
"#;
        let backend: BackendConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(backend.enabled);
        assert_eq!(backend.timeout, Duration::from_millis(500));
        assert_eq!(backend.env["TOKEN"], "abc");
        match backend.transport {
            TransportConfig::Stdio { command, cwd } => {
                assert_eq!(command, "fs-mcp --root /srv");
                assert_eq!(cwd.as_deref(), Some("/srv"));
            }
            TransportConfig::Http { .. } => panic!("expected stdio transport"),
        }
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/hub.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn validate_rejects_separator_in_backend_id() {
        let mut config = Config::default();
        config
            .backends
            .insert("bad__id".to_string(), BackendConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_grant() {
        let config = Config {
            gateway: GatewayConfig {
                permissions: vec!["mcp:tools/call".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn enabled_backends_skips_disabled_in_id_order() {
        let mut config = Config::default();
        config.backends.insert("b".into(), BackendConfig::default());
        config.backends.insert(
            "a".into(),
            BackendConfig {
                enabled: true,
                ..Default::default()
            },
        );
        config.backends.insert(
            "c".into(),
            BackendConfig {
                enabled: false,
                ..Default::default()
            },
        );

        let ids: Vec<&str> = config.enabled_backends().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn humantime_parses_units() {
        assert_eq!(humantime_serde::parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(humantime_serde::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(humantime_serde::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(humantime_serde::parse("7").unwrap(), Duration::from_secs(7));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn env_files_skip_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }
}
