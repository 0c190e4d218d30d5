//! MCP Hub - one permission-checked endpoint for many MCP servers

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use mcp_hub::{
    cli::{Cli, Command, ControlArgs, ServeArgs},
    config::Config,
    control::{ControlClient, ControlEndpoint, RuntimeSnapshot},
    gateway::{DataPlane, Gateway},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Serve(ref args)) => run_server(&cli, args).await,
        None => run_server(&cli, &ServeArgs::default()).await,
        Some(Command::Status { json, ref control }) => {
            report(run_status(&cli, control, json).await)
        }
        Some(Command::Reload { json, ref control }) => {
            report(run_reload(&cli, control, json).await)
        }
        Some(Command::Stop { ref control }) => report(run_stop(&cli, control).await),
    }
}

/// Run the gateway until stopped
async fn run_server(cli: &Cli, args: &ServeArgs) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = args.port {
                config.server.port = port;
            }
            if let Some(ref host) = args.host {
                config.server.host.clone_from(host);
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let data_plane = if args.stdio {
        DataPlane::Stdio
    } else {
        DataPlane::Http
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backends = config.backends.len(),
        data_plane = ?data_plane,
        "Starting MCP Hub"
    );

    let gateway = match Gateway::new(config, data_plane).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}

/// Connect to the control endpoint the configuration points at
async fn connect(cli: &Cli, args: &ControlArgs) -> anyhow::Result<ControlClient> {
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let endpoint = ControlEndpoint::from_config(&config);
    let timeout = args.timeout().unwrap_or(config.control.timeout);
    ControlClient::connect(&endpoint, timeout)
        .await
        .with_context(|| format!("Gateway not reachable at {endpoint}"))
}

async fn run_status(cli: &Cli, args: &ControlArgs, json: bool) -> anyhow::Result<bool> {
    let client = connect(cli, args).await?;
    let snapshot = client.status().await.context("status failed")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_status(&snapshot);
    }
    Ok(true)
}

async fn run_reload(cli: &Cli, args: &ControlArgs, json: bool) -> anyhow::Result<bool> {
    let client = connect(cli, args).await?;
    let report = client.reload().await.context("reload failed")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let status = if report.success { "Reloaded" } else { "Reload failed" };
        println!("{status}: {}", report.message.as_deref().unwrap_or(""));
        if !report.reloaded_connectors.is_empty() {
            println!("  Connected: {}", report.reloaded_connectors.join(", "));
        }
        if !report.failed_connectors.is_empty() {
            println!("  Failed:    {}", report.failed_connectors.join(", "));
        }
    }
    Ok(report.success)
}

async fn run_stop(cli: &Cli, args: &ControlArgs) -> anyhow::Result<bool> {
    let client = connect(cli, args).await?;
    let message = client.stop().await.context("stop failed")?;
    println!("{}", message.as_deref().unwrap_or("Stopping"));
    Ok(true)
}

fn print_status(snapshot: &RuntimeSnapshot) {
    println!("mcp-hub {} (pid {})", snapshot.version, snapshot.pid);
    println!("  Uptime:     {}s", snapshot.uptime_secs);
    println!("  Started:    {}", snapshot.started_at.to_rfc3339());
    println!("  Routes:     built {}", snapshot.routes_built_at.to_rfc3339());
    println!("  Control:    {}", snapshot.control_endpoint);
    println!("  In flight:  {}", snapshot.in_flight);
    println!("  Tools:      {}", snapshot.tool_count);
    println!("  Connectors: {}", snapshot.connectors.len());
    for id in &snapshot.connectors {
        let marker = if snapshot.degraded_connectors.contains(id) {
            " (not in catalog)"
        } else {
            ""
        };
        println!("    - {id}{marker}");
    }
}

fn report(outcome: anyhow::Result<bool>) -> ExitCode {
    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
