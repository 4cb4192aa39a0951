//! Tandem CLI - Signaling checks and a bundled relay
//!
//! Usage:
//!   tandem ping                       Measure round trip to the relay
//!   tandem room <id> [--create]       Hold a room open and report peers
//!   tandem signal                     Run the signal server
//!   tandem config                     Print or write a sample config

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use tandem_client::{
    ChannelEvent, ChannelSettings, ChannelState, ReconnectingChannel, RoomJoinProtocol,
    WsTransport,
};
use tandem_core::{Config, RoomId};
use tandem_signal::{ClientMessage, ServerMessage};

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Two-party call signaling", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Signal server URL (overrides config)
    #[arg(short, long, global = true)]
    signal: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure the round trip to the signal server
    Ping,

    /// Join a room and report peers until interrupted
    Room {
        /// Room id shared with the other participant
        id: String,

        /// Create the room instead of joining it
        #[arg(long)]
        create: bool,
    },

    /// Run the signal server
    Signal {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<std::net::IpAddr>,
    },

    /// Print a sample config, or write it to the default location
    Config {
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load(),
    };
    if let Some(url) = cli.signal {
        config.client.signal_url = url;
    }

    match cli.command {
        Commands::Ping => run_ping(&config).await?,
        Commands::Room { id, create } => run_room(&config, RoomId::from(id), create).await?,
        Commands::Signal { port, bind } => run_signal(&config, port, bind).await?,
        Commands::Config { init } => run_config(init)?,
    }

    Ok(())
}

fn open_channel(config: &Config) -> anyhow::Result<ReconnectingChannel> {
    let transport = WsTransport::new(&config.client.signal_url, &config.channel_retry)?;
    let settings = ChannelSettings::from_config(&config.client, &config.channel_retry);
    Ok(ReconnectingChannel::new(Arc::new(transport), settings))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn run_ping(config: &Config) -> anyhow::Result<()> {
    let channel = open_channel(config)?;
    let mut events = channel.subscribe();
    channel
        .connect()
        .await
        .with_context(|| format!("connecting to {}", config.client.signal_url))?;

    let sent = now_millis();
    channel.send(&ClientMessage::Ping { timestamp: sent })?;

    let pong = tokio::time::timeout(config.client.request_timeout(), async {
        loop {
            match events.recv().await {
                Ok(ChannelEvent::Message(ServerMessage::Pong { timestamp })) if timestamp == sent => {
                    return Ok(());
                }
                Ok(_) => continue,
                Err(e) => return Err(e),
            }
        }
    })
    .await;

    channel.disconnect().await;
    match pong {
        Ok(Ok(())) => {
            info!(
                "Pong from {} in {} ms",
                config.client.signal_url,
                now_millis().saturating_sub(sent)
            );
            Ok(())
        }
        Ok(Err(e)) => bail!("signal channel closed: {}", e),
        Err(_) => bail!("no pong within {:?}", config.client.request_timeout()),
    }
}

async fn run_room(config: &Config, room: RoomId, create: bool) -> anyhow::Result<()> {
    let channel = open_channel(config)?;
    channel
        .connect()
        .await
        .with_context(|| format!("connecting to {}", config.client.signal_url))?;
    let mut events = channel.subscribe();

    let protocol = RoomJoinProtocol::new(&config.join, config.client.join_timeout());
    protocol
        .run(&channel, &room, create)
        .await
        .with_context(|| format!("joining room {}", room))?;

    info!("");
    info!("  In room: {}", room);
    if create {
        info!("  Run on another machine:");
        info!("    tandem room {}", room);
    }
    info!("");

    let mut last_state = ChannelState::Connected;
    let result = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ChannelEvent::Message(ServerMessage::PeerJoined { member_id })) => {
                    info!("Peer joined: {}", member_id);
                }
                Ok(ChannelEvent::Message(ServerMessage::PeerLeft { member_id })) => {
                    info!("Peer left: {}", member_id);
                }
                Ok(ChannelEvent::StateChanged(state)) => {
                    let previous = std::mem::replace(&mut last_state, state);
                    match state {
                        ChannelState::Reconnecting => warn!("Lost the signal server, reconnecting..."),
                        ChannelState::Connected if previous == ChannelState::Reconnecting => {
                            if let Err(e) = protocol.run(&channel, &room, create).await {
                                break Err(e).context("rejoining after reconnect");
                            }
                            info!("Rejoined room {}", room);
                        }
                        ChannelState::Failed => {
                            break Err(anyhow::anyhow!("gave up reconnecting to the signal server"));
                        }
                        _ => {}
                    }
                }
                Ok(_) => {}
                Err(e) => break Err(e.into()),
            },
            _ = signal::ctrl_c() => {
                info!("Leaving room...");
                break Ok(());
            }
        }
    };

    if channel.state() == ChannelState::Connected {
        let _ = channel.send(&ClientMessage::LeaveRoom {
            room_id: room.clone(),
        });
    }
    channel.disconnect().await;
    result
}

async fn run_signal(
    config: &Config,
    port: Option<u16>,
    bind: Option<std::net::IpAddr>,
) -> anyhow::Result<()> {
    let bind_addr = SocketAddr::new(
        bind.unwrap_or(config.relay.bind),
        port.unwrap_or(config.relay.port),
    );

    info!("Starting Tandem signal server...");
    info!("  Listening on: ws://{}", bind_addr);

    let server = tandem_signal::SignalServer::new();

    // Handle Ctrl+C
    tokio::select! {
        result = server.serve(bind_addr) => {
            if let Err(e) = result {
                error!("Signal server error: {:?}", e);
                return Err(e.into());
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}

fn run_config(init: bool) -> anyhow::Result<()> {
    if !init {
        print!("{}", Config::sample());
        return Ok(());
    }

    let Some(path) = Config::default_path() else {
        bail!("no platform config directory available");
    };
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    Config::default()
        .save_to(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!("Wrote {}", path.display());
    Ok(())
}
