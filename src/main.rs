//! `mcp-mux` command-line entry point.
//!
//! Loads the server list, admits servers into an [`McpManager`], runs one
//! command against them, and always shuts them down before exiting.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use mcp_mux::config::{self, AppConfig};
use mcp_mux::McpManager;

/// How long graceful shutdown may take before servers are force-killed.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "mcp-mux", version, about = "Launch and drive MCP tool servers over stdio")]
struct Cli {
    /// Configuration file (defaults to the platform config directory).
    #[arg(long, short, env = "MCP_MUX_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a starter configuration file if none exists.
    Init,
    /// Start every configured server and print a health report.
    Check,
    /// Start every configured server and list their tools.
    Tools,
    /// Start one configured server and call one of its tools.
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(default_value = "{}")]
        arguments: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let path = cli.config.unwrap_or_else(config::default_config_path);
    let manager = McpManager::new();

    let outcome = tokio::select! {
        outcome = run(&manager, &path, cli.command) => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, shutting down");
            Ok(())
        }
    };

    shutdown(&manager).await;
    outcome
}

async fn run(manager: &McpManager, path: &Path, command: Command) -> Result<()> {
    match command {
        Command::Init => {
            if config::write_default_config(path)? {
                println!("wrote {}", path.display());
            } else {
                println!("{} already exists, leaving it untouched", path.display());
            }
        }
        Command::Check => {
            let app = load(path)?;
            let failed = start_all(manager, &app).await;
            print_json(&manager.health_check().await)?;
            if failed > 0 {
                bail!("{failed} server(s) failed to start");
            }
        }
        Command::Tools => {
            let app = load(path)?;
            start_all(manager, &app).await;
            print_json(&manager.get_available_tools().await)?;
        }
        Command::Call {
            server,
            tool,
            arguments,
        } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&arguments).context("arguments must be valid JSON")?;
            let app = load(path)?;
            let entry = app
                .server(&server)
                .with_context(|| format!("server '{server}' is not configured"))?;

            manager
                .add_server(entry.to_server_config())
                .await
                .with_context(|| format!("failed to start server '{server}'"))?;
            let result = manager.execute_tool(&server, &tool, arguments).await?;
            print_json(&result)?;
        }
    }
    Ok(())
}

fn load(path: &Path) -> Result<AppConfig> {
    config::load_config(path).with_context(|| {
        format!(
            "could not load {} (run `mcp-mux init` to create one)",
            path.display()
        )
    })
}

/// Admit every configured server. Returns how many failed.
async fn start_all(manager: &McpManager, app: &AppConfig) -> usize {
    let configs = app.server_configs();
    if configs.is_empty() {
        tracing::warn!("no MCP servers configured");
        return 0;
    }

    let failures = manager.add_servers(configs).await;
    for (name, e) in &failures {
        tracing::error!(server = %name, error = %e, "failed to start MCP server");
    }
    failures.len()
}

async fn shutdown(manager: &McpManager) {
    // A timed-out shutdown future drops its supervisors, which kills their groups.
    if tokio::time::timeout(SHUTDOWN_DEADLINE, manager.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("graceful shutdown timed out, force-stopping remaining servers");
        manager.force_shutdown().await;
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{text}");
    Ok(())
}

/// Initialize the tracing subscriber on stderr; stdout carries command output.
fn init_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_mux=info,warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
