//! Gossipnet Node -- single binary P2P engine.
//!
//! Usage:
//!   gossipnet-node                              # Run with default config
//!   gossipnet-node --config path.toml           # Run with custom config
//!   gossipnet-node --port 20001 --seeds 127.0.0.1:20000
//!   gossipnet-node identity                     # Show or generate a peer id

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use gossipnet_node::config::{NodeConfig, SeedNode};
use gossipnet_node::{DirectionFilter, Engine};
use gossipnet_protocol::PeerId;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "gossipnet-node", about = "Gossipnet P2P node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "gossipnet.toml")]
    config: PathBuf,

    /// Listening port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Listening host (overrides config)
    #[arg(long)]
    listen_host: Option<String>,

    /// Extra seed nodes, `;`-separated host[:port] entries
    #[arg(short, long)]
    seeds: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Show the configured peer id or generate a fresh one
    Identity {
        #[command(subcommand)]
        action: Option<IdentityAction>,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Print a new random peer id
    Generate,
    /// Show the peer id from the config file
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gossipnet_node=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = NodeConfig::load_or_default(&cli.config)?;
    if let Some(port) = cli.port {
        cfg.network.port = port;
    }
    if let Some(host) = cli.listen_host {
        cfg.network.listen_host = host;
    }
    if let Some(seeds) = cli.seeds.as_deref() {
        for seed in SeedNode::parse_list(seeds)? {
            cfg.network.add_seed_node(seed.host, seed.port);
        }
    }

    match cli.command {
        Some(Commands::Identity { action }) => match action {
            Some(IdentityAction::Generate) => {
                println!("Peer ID: {}", PeerId::random());
            }
            Some(IdentityAction::Show) | None => match cfg.node.peer_id {
                Some(id) => println!("Peer ID: {id}"),
                None => {
                    eprintln!(
                        "No peer_id in {}; a random one is generated at startup",
                        cli.config.display()
                    );
                    std::process::exit(1);
                }
            },
        },
        Some(Commands::Run) | None => {
            run_node(cfg).await?;
        }
    }

    Ok(())
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let timers = cfg.timers.clone();
    let engine = Engine::new(cfg)?;
    let local = engine.start().await?;
    tracing::info!(
        peer = %engine.peer_id(),
        %local,
        seeds = engine.config().network.seed_nodes.len(),
        "node started"
    );

    engine.connect_to_seed_nodes().await;

    let token = CancellationToken::new();
    let mut handles = Vec::new();

    handles.push(spawn_every(
        token.clone(),
        Duration::from_secs(timers.connect_seeds_secs),
        engine.clone(),
        |engine| async move {
            engine.connect_to_seeds_if_isolated().await;
        },
    ));
    handles.push(spawn_every(
        token.clone(),
        Duration::from_secs(timers.exchange_peers_secs),
        engine.clone(),
        |engine| async move {
            let report = engine.exchange_peer_lists().await;
            tracing::debug!(sent = report.sent, failed = report.failed.len(), "peer lists exchanged");
        },
    ));
    handles.push(spawn_every(
        token.clone(),
        Duration::from_secs(timers.ping_secs),
        engine.clone(),
        |engine| async move {
            engine.ping_peers().await;
            let peers = engine.connections(DirectionFilter::Any).await;
            tracing::debug!(connections = peers.len(), "pinged peers");
        },
    ));

    tracing::info!("all tasks spawned, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    token.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    engine.shutdown().await;

    tracing::info!(stats = ?engine.stats().snapshot(), "shutdown complete");
    Ok(())
}

/// Run `tick` every `period` until `token` is cancelled. The first tick
/// fires one period after start.
fn spawn_every<F, Fut>(
    token: CancellationToken,
    period: Duration,
    engine: Engine,
    tick: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(Engine) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let period = period.max(Duration::from_secs(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => tick(engine.clone()).await,
                _ = token.cancelled() => break,
            }
        }
    })
}
