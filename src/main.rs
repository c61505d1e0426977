//! Presence Sync
//!
//! Command-line front end: dedicated server with an operator console,
//! client, serverless gossip peer and LAN discovery.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use presence_sync::console;
use presence_sync::network::discovery::{DiscoveryConfig, DiscoveryListener};
use presence_sync::{
    ConnectionEngine, PlayerAppearance, PlayerId, PlayerMetadata, PresenceServer, ServerlessPeer, Settings, VERSION,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Settings file
    #[clap(short, long, default_value = "presence-sync.toml")]
    config: PathBuf,

    #[clap(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run a dedicated server with an operator console on stdin
    Server {
        /// Override the listen port
        #[clap(short, long)]
        port: Option<u16>,
        /// Override the monitoring port
        #[clap(long)]
        monitor_port: Option<u16>,
    },
    /// Connect to a server by saved name or host:port
    Client {
        /// Saved server name or host:port
        server: String,
        /// Override the display name
        #[clap(short, long)]
        name: Option<String>,
    },
    /// Join a serverless gossip group
    Serverless {
        /// Extra peers to contact (host:port)
        #[clap(short, long)]
        peer: Vec<String>,
    },
    /// Listen for LAN servers
    Discover {
        /// How long to listen
        #[clap(short, long, default_value = "6")]
        seconds: u64,
    },
    /// Rewrite the settings file with every key and its description
    WriteConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = Settings::load(&args.config).with_context(|| format!("loading {}", args.config.display()))?;
    info!("Presence Sync v{}", VERSION);

    match args.mode {
        Mode::Server { port, monitor_port } => run_server(settings, port, monitor_port).await,
        Mode::Client { server, name } => run_client(settings, &server, name).await,
        Mode::Serverless { peer } => run_serverless(settings, peer).await,
        Mode::Discover { seconds } => run_discover(Duration::from_secs(seconds)).await,
        Mode::WriteConfig => {
            settings
                .save(&args.config)
                .with_context(|| format!("writing {}", args.config.display()))?;
            info!("Wrote {}", args.config.display());
            Ok(())
        }
    }
}

async fn run_server(settings: Settings, port: Option<u16>, monitor_port: Option<u16>) -> Result<()> {
    let mut config = settings.server_config()?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(port) = monitor_port {
        config.monitor_port = Some(port);
    }

    let server = PresenceServer::new(config);
    server.start().await.context("starting server")?;

    let interrupt = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let result = console::run(
        &server,
        BufReader::new(tokio::io::stdin()),
        interrupt,
        Duration::from_millis(250),
        || server.poll(),
    )
    .await;

    server.shutdown().await;
    result.map_err(Into::into)
}

async fn run_client(settings: Settings, target: &str, name: Option<String>) -> Result<()> {
    let endpoint = match settings.find_server(target) {
        Some(entry) => entry.endpoint.clone(),
        None => target.to_string(),
    };
    let addr = resolve(&endpoint).await?;

    let engine = ConnectionEngine::new(settings.client_config());
    let name = name.unwrap_or_else(|| settings.display_name.clone());
    let id = PlayerId::new_v4();
    engine.set_local(PlayerMetadata::new(id, name.clone()));
    engine.set_appearance(PlayerAppearance::new(id, name, settings.appearance.clone()));
    engine.connect(addr)?;

    let mut events = engine.subscribe();
    let mut ticker = interval(Duration::from_secs(1));
    let mut last_status = String::new();
    let mut last_count = usize::MAX;
    let result = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.poll() {
                    break Err(anyhow!(e));
                }
                let status = engine.status();
                let count = engine.registry().len();
                if status != last_status || count != last_count {
                    info!("{} ({} other players)", status, count);
                    last_status = status;
                    last_count = count;
                }
            }
            event = events.recv() => {
                if let Ok(event) = event {
                    info!("Event: {:?}", event);
                }
            }
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };

    engine.disconnect().await;
    result
}

async fn run_serverless(settings: Settings, extra: Vec<String>) -> Result<()> {
    let mut config = settings.serverless_config()?;
    for peer in extra {
        config.bootstrap.push(resolve(&peer).await?);
    }

    let peer = ServerlessPeer::new(config, settings.display_name.clone());
    peer.start().await.context("starting serverless peer")?;

    let mut ticker = interval(Duration::from_secs(1));
    let mut last_count = usize::MAX;
    let result = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = peer.poll() {
                    break Err(anyhow!(e));
                }
                let count = peer.registry().len();
                if count != last_count {
                    info!("{} peers", count);
                    last_count = count;
                }
            }
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };

    peer.shutdown().await;
    result
}

async fn run_discover(duration: Duration) -> Result<()> {
    let listener = Arc::new(DiscoveryListener::bind(DiscoveryConfig::default()).await?);
    let cancel = CancellationToken::new();
    let task = {
        let listener = listener.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { listener.run(cancel).await })
    };

    sleep(duration).await;
    cancel.cancel();
    if let Err(e) = task.await? {
        warn!("Discovery stopped with error: {}", e);
    }

    let servers = listener.compatible();
    if servers.is_empty() {
        println!("no servers found");
    }
    for s in servers {
        println!("{:<24}  {}", s.name, s.addr);
    }
    for s in listener.incompatible() {
        println!("{:<24}  {}  (version {}, incompatible)", s.name, s.addr, s.version);
    }
    Ok(())
}

async fn resolve(endpoint: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(endpoint)
        .await
        .with_context(|| format!("resolving {}", endpoint))?
        .next()
        .ok_or_else(|| anyhow!("{} did not resolve", endpoint))
}
