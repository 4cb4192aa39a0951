//! Tandem Signal Server
//!
//! Lightweight WebSocket relay for two-party room signaling.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (or values from the config file)
//! tandem-signal
//!
//! # Explicit port and structured logs
//! tandem-signal --port 9000 --json-logs
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tandem_core::Config;
use tandem_signal::SignalServer;

#[derive(Parser, Debug)]
#[command(name = "tandem-signal")]
#[command(about = "Tandem signaling relay for two-party rooms")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides config)
    #[arg(short, long, env = "TANDEM_PORT")]
    port: Option<u16>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Config file path (defaults to the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    if args.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load(),
    };

    let addr = SocketAddr::new(
        args.bind.unwrap_or(config.relay.bind),
        args.port.unwrap_or(config.relay.port),
    );

    info!("Starting Tandem Signal Server");

    let server = SignalServer::new();
    tokio::select! {
        result = server.serve(addr) => {
            result.with_context(|| format!("serving on {}", addr))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!(
                rooms = server.room_count(),
                members = server.member_count(),
                "Shutting down"
            );
        }
    }

    Ok(())
}
