use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bridgr::config::Settings;
use bridgr::coordinator::{CoordinatorConfig, TransportCoordinator};
use bridgr::event::{verify_event, Event};
use bridgr::identity::Identity;
use bridgr::queue::{SeedingQueue, SeedingQueueConfig};
use bridgr::relay_client::RelayClient;
use bridgr::server::RelayInfo;
use bridgr::store::RelayStore;
use bridgr::swarm::{MemorySwarm, Swarm, SwarmConfig};
use bridgr::ws::{serve, WsState};
use bridgr::{FeedManager, FeedManagerConfig};

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "bridgr", author, version, about = "Nostr relay with a BitTorrent bridge")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Launch the relay (and the bridge pipeline if enabled).
    Serve,
    /// Ingest one or more event files into the store.
    Ingest {
        /// Paths to JSON event files to ingest.
        #[arg(required = true)]
        files: Vec<String>,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = Settings::from_env(&cli.env)?;
    let store = RelayStore::open(&cfg.db_path)?;
    match cli.command {
        Commands::Ingest { files } => {
            for f in files {
                let data = std::fs::read_to_string(&f)?;
                let ev: Event = serde_json::from_str(&data)?;
                verify_event(&ev)?;
                let inserted = store.save_event(&ev)?;
                tracing::info!(id = %ev.id, inserted, "ingested {f}");
            }
        }
        Commands::Serve => {
            let queue = if cfg.enable_bt {
                Some(seeding_pipeline(&cfg, store.clone()))
            } else {
                None
            };
            let info = RelayInfo {
                name: cfg.relay_name.clone(),
                description: cfg.relay_description.clone(),
                pubkey: cfg.relay_pubkey.clone(),
                contact: cfg.relay_contact.clone(),
                ..Default::default()
            };
            let state = WsState::new(store, info, cfg.allowed_pubkeys.clone(), queue.clone());
            let addr: SocketAddr = format!("0.0.0.0:{}", cfg.port).parse()?;
            tracing::info!(%addr, bt = cfg.enable_bt, "relay listening");
            serve(addr, state, shutdown_signal()).await?;
            if let Some(queue) = queue {
                queue.close().await;
            }
        }
    }
    Ok(())
}

/// Wire the swarm, feed manager, and coordinator behind a seeding queue.
fn seeding_pipeline(cfg: &Settings, store: RelayStore) -> Arc<SeedingQueue> {
    let mut trackers = vec![];
    if let Some(port) = cfg.tracker_port {
        let host = cfg.dht_host.clone().unwrap_or_else(|| "127.0.0.1".into());
        trackers.push(format!("udp://{host}:{port}"));
    }
    let swarm = MemorySwarm::new(SwarmConfig {
        trackers: trackers.clone(),
        dht_bootstrap: cfg.dht_bootstrap.clone(),
        dht_host: cfg.dht_host.clone(),
    });
    let identity = Arc::new(Identity::generate());
    tracing::info!(pubkey = %identity.public_key_hex(), "swarm identity ready");
    let relay_pubkey = cfg
        .relay_pubkey
        .as_deref()
        .and_then(|hex| hex::decode(hex).ok())
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok());
    let feed = Arc::new(FeedManager::new(
        Arc::clone(&identity),
        Arc::clone(&swarm) as Arc<dyn Swarm>,
        relay_pubkey,
        FeedManagerConfig::default(),
    ));
    let feed_sync = Arc::clone(&feed);
    tokio::spawn(async move {
        let seq = feed_sync.sync_sequence().await;
        tracing::debug!(seq, "feed pointer sequence synced");
    });
    let coordinator = TransportCoordinator::new(
        RelayClient::new(vec![], None),
        Arc::clone(&swarm) as Arc<dyn Swarm>,
        Some(feed),
        None,
        CoordinatorConfig {
            trackers,
            ..Default::default()
        },
    );
    SeedingQueue::new(
        move |ev: Event| {
            let coordinator = Arc::clone(&coordinator);
            let store = store.clone();
            async move {
                let uri = coordinator.reseed_event(&ev, false).await?;
                store.set_magnet(&ev.id, &uri)?;
                tracing::debug!(id = %ev.id, %uri, "event seeded");
                Ok(())
            }
        },
        SeedingQueueConfig::default(),
    )
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("bridgr=info".parse().unwrap()),
        )
        .init();
    let cli = Cli::parse();
    run(cli).await
}
