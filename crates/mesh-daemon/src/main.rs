//! mesh-daemon: Headless mesh chat node.
//!
//! Listens for WebSocket links, joins the swarm through optional seed peers,
//! broadcasts every stdin line as a chat message and prints what the swarm
//! reports.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mesh_core::{DialOutcome, MeshConfig, MeshNode, PeerId};
use mesh_daemon::chat::{self, ChatMessage};
use mesh_daemon::WsTransport;

#[derive(Parser, Debug)]
#[command(name = "mesh-daemon")]
#[command(about = "Self-organizing P2P mesh chat node")]
struct Args {
    /// Address to listen on for incoming links
    #[arg(short, long, default_value = "127.0.0.1:0")]
    listen: String,

    /// URL peers should dial to reach us (defaults to ws://<listen address>)
    #[arg(long)]
    advertise: Option<String>,

    /// Peer URL to join through (repeatable)
    #[arg(short, long = "seed")]
    seeds: Vec<String>,

    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Give up on pending connections after this many seconds
    #[arg(long)]
    dial_timeout_secs: Option<u64>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn load_config(args: &Args) -> Result<MeshConfig> {
    let mut config = match &args.config {
        Some(path) => MeshConfig::load(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => MeshConfig::default(),
    };
    if args.dial_timeout_secs.is_some() {
        config.dial_timeout_secs = args.dial_timeout_secs;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,mesh_daemon=debug,mesh_core=debug"
    } else {
        "info,mesh_daemon=info,mesh_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting mesh-daemon");
    let config = load_config(&args)?;

    let (transport, transport_events) =
        WsTransport::bind(&args.listen, args.advertise.as_deref()).await?;
    info!("Peer ID: {}", transport.peer_id());

    let node = MeshNode::new(transport.clone(), transport_events, config);
    let mut events = node.events();
    let (mesh, node_task) = node.spawn();

    for seed in &args.seeds {
        let peer: PeerId = match seed.parse() {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Skipping seed {:?}: {}", seed, e);
                continue;
            }
        };
        match mesh.connect(&peer).await? {
            DialOutcome::Dialing(conn) => info!("Joining through {} ({})", peer, conn),
            DialOutcome::Skipped(reason) => info!("Not dialing seed {}: {:?}", peer, reason),
            DialOutcome::Failed(e) => warn!("Could not dial seed {}: {}", peer, e),
        }
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    info!("Node running. Type to chat, Ctrl+C to stop.");

    loop {
        tokio::select! {
            // Print mesh events
            Some(event) = events.recv() => {
                println!("{}", chat::describe(&event));
            }

            // Broadcast each stdin line
            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        let text = line.trim();
                        if text.is_empty() {
                            continue;
                        }
                        let sent = mesh.broadcast(ChatMessage::new(text).to_value()).await?;
                        if sent == 0 {
                            println!("* nobody is connected yet");
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed, still relaying events");
                        stdin_open = false;
                    }
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                }
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    mesh.shutdown();
    let _ = node_task.await;
    transport.shutdown();
    Ok(())
}
