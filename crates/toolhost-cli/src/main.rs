//! toolhost CLI: start configured MCP servers and use their tools.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use toolhost_config::{CliOverrides, ToolhostConfig};
use toolhost_mcp::{McpError, ServerPool, ToolCallResult};

#[derive(Parser)]
#[command(name = "toolhost", version, about = "Run MCP servers and call their tools")]
struct Cli {
    /// Path to config.toml (defaults to ~/.toolhost/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the tools of every running server as server.tool
    Tools,
    /// Call a tool and print its result as JSON
    Call {
        /// Tool name, qualified (server.tool) or bare when unambiguous
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Show the status of every configured server
    Status,
}

/// Exit code when the tool ran but reported an error.
const TOOL_ERROR_EXIT: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = ToolhostConfig::load(CliOverrides {
        config_path: cli.config,
    })
    .context("Failed to load configuration")?;

    // Set up logging
    let log_level = if cli.verbose {
        "debug"
    } else {
        config.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    // Parse arguments before any server is spawned.
    let call_args = match &cli.command {
        Command::Call { args, .. } => Some(parse_arguments(args)?),
        _ => None,
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; stopping MCP servers");
            ctrl_c.cancel();
        }
    });

    if config.servers.is_empty() {
        eprintln!(
            "No MCP servers configured in {}",
            config.config_path.display()
        );
    }

    let pool = ServerPool::new(config.servers.clone());
    let report = pool.start_enabled_servers(&cancel).await;
    for (name, e) in &report.failed {
        eprintln!("Warning: MCP server '{name}' failed to start: {e}");
    }

    let outcome = match cli.command {
        Command::Tools => print_tools(&pool),
        Command::Status => print_status(&pool),
        Command::Call { tool, .. } => {
            let arguments = call_args.unwrap_or_default();
            tokio::select! {
                result = pool.call_tool(&tool, arguments) => print_call_result(&tool, result),
                _ = cancel.cancelled() => Err(anyhow::anyhow!("Interrupted")),
            }
        }
    };

    // Servers are always stopped, even when the command failed.
    pool.stop_all().await;
    outcome
}

fn parse_arguments(raw: &str) -> Result<Value> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("--args is not valid JSON: {raw}"))?;
    anyhow::ensure!(value.is_object(), "--args must be a JSON object");
    Ok(value)
}

fn print_tools(pool: &ServerPool) -> Result<ExitCode> {
    let mut out = io::stdout().lock();
    for tool in pool.tools() {
        if tool.tool.description.is_empty() {
            writeln!(out, "{}", tool.qualified_name())?;
        } else {
            writeln!(out, "{}  {}", tool.qualified_name(), tool.tool.description)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_status(pool: &ServerPool) -> Result<ExitCode> {
    let mut out = io::stdout().lock();
    for state in pool.statuses() {
        let enabled = if state.enabled { "" } else { " (disabled)" };
        writeln!(
            out,
            "{}: {}{} ({} tools)",
            state.name, state.status, enabled, state.tool_count
        )?;
        if let Some(e) = &state.last_error {
            writeln!(out, "  last error: {e}")?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_call_result(tool: &str, result: Result<ToolCallResult, McpError>) -> Result<ExitCode> {
    let result = result.with_context(|| format!("Calling {tool} failed"))?;
    let rendered = serde_json::to_string_pretty(&result.raw)?;
    writeln!(io::stdout().lock(), "{rendered}")?;
    if result.is_error {
        tracing::debug!("Tool {tool} reported an error");
        return Ok(ExitCode::from(TOOL_ERROR_EXIT));
    }
    Ok(ExitCode::SUCCESS)
}
