//! wshub: multi-port WebSocket broadcast server, entry point.
//!
//! # Usage
//!
//! ```text
//! wshub [--log-file PATH] start [COUNT] [--address ADDR] [--foreground]
//! wshub [--log-file PATH] serve [--address ADDR] [--port PORT]
//! ```
//!
//! `start` detaches from the terminal and runs COUNT (default 2) servers on
//! consecutive ports beginning at a random base.  Stop it with
//! `kill -TERM <supervisor pid>`.  With `--foreground` it stays attached and
//! Ctrl+C also stops it.
//!
//! `serve` runs a single server in the current process until Ctrl+C.
//!
//! # Environment variable overrides
//!
//! | Variable          | Default   | Description                          |
//! |-------------------|-----------|--------------------------------------|
//! | `RUST_LOG`        | `info`    | Log filter                           |
//! | `WSHUB_LOG_FILE`  | (stdout)  | Append logs to this file             |
//! | `WSHUB_ADDRESS`   | `0.0.0.0` | Address every server binds to        |
//!
//! A detached supervisor has its stdout pointed at `/dev/null`, so use
//! `--log-file` to keep its logs.

use std::fs::OpenOptions;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use wshub_server::domain::{PortAssignment, ServerConfig, SupervisorConfig};
use wshub_server::infrastructure::{DaemonSupervisor, ServerProcess};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Multi-port WebSocket broadcast server.
#[derive(Debug, Parser)]
#[command(name = "wshub", about = "Multi-port WebSocket broadcast server", version)]
struct Cli {
    /// Append logs to this file instead of standard output.
    #[arg(long, global = true, env = "WSHUB_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Detach and run COUNT servers on consecutive ports.
    Start {
        /// Number of servers (one per port).
        #[arg(default_value_t = 2)]
        count: u16,

        /// IP address every server binds to.
        #[arg(long, default_value = "0.0.0.0", env = "WSHUB_ADDRESS")]
        address: String,

        /// Stay attached to the terminal; Ctrl+C stops the servers.
        #[arg(long)]
        foreground: bool,
    },

    /// Run a single server in this process.
    Serve {
        /// IP address to bind.
        #[arg(long, default_value = "0.0.0.0", env = "WSHUB_ADDRESS")]
        address: String,

        /// Port to bind; random in 1024..=65534 when omitted.
        #[arg(long)]
        port: Option<u16>,
    },
}

fn parse_address(address: &str) -> anyhow::Result<IpAddr> {
    address
        .parse()
        .with_context(|| format!("invalid bind address: '{address}'"))
}

impl Command {
    fn into_supervisor_config(self) -> anyhow::Result<SupervisorConfig> {
        match self {
            Command::Start {
                count,
                address,
                foreground,
            } => Ok(SupervisorConfig {
                address: parse_address(&address)?,
                servers: count,
                foreground,
            }),
            Command::Serve { .. } => anyhow::bail!("`serve` runs a single server"),
        }
    }

    fn into_server_config(self) -> anyhow::Result<ServerConfig> {
        match self {
            Command::Serve { address, port } => {
                let port = match port {
                    Some(port) => port,
                    None => PortAssignment::random(1)?.base(),
                };
                Ok(ServerConfig::new(SocketAddr::new(
                    parse_address(&address)?,
                    port,
                )))
            }
            Command::Start { .. } => anyhow::bail!("`start` runs a supervisor"),
        }
    }
}

// ── Logging ───────────────────────────────────────────────────────────────────

/// `RUST_LOG` controls the filter (default `info`).  A log file is opened in
/// append mode before any fork so every process writes to the same file.
fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    match cli.command {
        command @ Command::Start { .. } => {
            let config = command.into_supervisor_config()?;
            let supervisor =
                DaemonSupervisor::from_config(config).context("cannot assign ports")?;
            supervisor.run().context("supervisor failed")?;
        }
        command @ Command::Serve { .. } => {
            let config = command.into_server_config()?;
            let server = ServerProcess::bind(config).context("cannot start server")?;
            info!("wshub serving on ws://{}", server.local_addr());
            server.run().context("server failed")?;
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
