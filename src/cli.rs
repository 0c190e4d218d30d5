//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// MCP Hub - one permission-checked endpoint for many MCP servers
#[derive(Parser, Debug)]
#[command(name = "mcp-hub")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_HUB_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MCP_HUB_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MCP_HUB_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway (default)
    Serve(ServeArgs),

    /// Show the running gateway's state
    Status {
        /// Print the raw snapshot as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        control: ControlArgs,
    },

    /// Re-read the config file and rebuild connectors
    Reload {
        /// Print the raw report as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        control: ControlArgs,
    },

    /// Drain calls in flight and stop the gateway
    Stop {
        #[command(flatten)]
        control: ControlArgs,
    },
}

/// Options for `serve`
#[derive(clap::Args, Debug, Default)]
pub struct ServeArgs {
    /// Serve JSON-RPC on stdin/stdout instead of HTTP
    #[arg(long)]
    pub stdio: bool,

    /// Port to listen on
    #[arg(short, long, env = "MCP_HUB_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "MCP_HUB_HOST")]
    pub host: Option<String>,
}

/// Options shared by the control-plane clients
#[derive(clap::Args, Debug, Default)]
pub struct ControlArgs {
    /// Seconds to wait for the gateway's answer (defaults to `control.timeout`)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

impl ControlArgs {
    /// Explicit timeout, if one was given
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["mcp-hub", "--config", "hub.yaml"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, Some(PathBuf::from("hub.yaml")));
    }

    #[test]
    fn serve_stdio_flag() {
        let cli = Cli::try_parse_from(["mcp-hub", "serve", "--stdio"]).unwrap();
        match cli.command {
            Some(Command::Serve(args)) => assert!(args.stdio),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn control_subcommands_take_global_config_and_timeout() {
        let cli =
            Cli::try_parse_from(["mcp-hub", "reload", "-c", "/etc/hub.yaml", "--timeout", "9"])
                .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/hub.yaml")));
        match cli.command {
            Some(Command::Reload { json, control }) => {
                assert!(!json);
                assert_eq!(control.timeout(), Some(Duration::from_secs(9)));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
