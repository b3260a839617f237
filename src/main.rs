//! Redlead - Leader-Election Sidecar for Replicated Redis
//!
//! Runs next to a Redis pod, participates in a Lease-based leader
//! election and keeps the local Redis role, the leader Service and the
//! leader TCP relay consistent with the election outcome.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use redlead::config::{self, Config, ConfigOptions};
use redlead::coordinator::Coordinator;
use redlead::discovery::ServiceDiscovery;
use redlead::election::LeaseElection;
use redlead::error::{Error, Result};
use redlead::relay::Relay;
use redlead::store::RedisStore;

/// Redlead - Leader-Election Sidecar for Replicated Redis
#[derive(Parser)]
#[command(name = "redlead")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Name of the Service exposing the current primary
    #[arg(long)]
    leader_service: Option<String>,

    /// Name of the Kubernetes Lease lock
    #[arg(long)]
    lock: Option<String>,

    /// Port exposed by the local Redis server (default 6379)
    #[arg(long)]
    redis_port: Option<u16>,

    /// Port this sidecar listens on for primary connections (default 6378)
    #[arg(long)]
    leader_port: Option<u16>,

    /// Kubernetes cluster domain (default cluster.local)
    #[arg(long)]
    cluster_domain: Option<String>,

    /// Name of the headless service attached to the StatefulSet
    #[arg(long)]
    headless_service: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if let Err(e) = run(cli).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let namespace = config::read_namespace(Path::new(config::NAMESPACE_FILE))?;
    let identity = config::hostname()?;

    let config = Config::resolve(
        ConfigOptions {
            leader_service: cli.leader_service,
            lock_name: cli.lock,
            redis_port: cli.redis_port,
            relay_port: cli.leader_port,
            cluster_domain: cli.cluster_domain,
            headless_service: cli.headless_service,
        },
        namespace,
        identity,
    )?;
    tracing::info!(
        "starting redlead as {} in namespace {}",
        config.identity,
        config.namespace
    );

    // Connect to the in-cluster Kubernetes API.
    let client = kube::Client::try_default().await.map_err(|e| {
        tracing::error!("failed to build in-cluster Kubernetes client: {}", e);
        Error::Kubernetes(e)
    })?;

    // Connect to the local Redis and require an initial ping.
    tracing::debug!("connecting to Redis at {}", config.store_address());
    let store = RedisStore::connect(config.redis_port).await?;
    if let Err(e) = store.ping().await {
        tracing::error!("failed to get initial ping from Redis: {}", e);
        return Err(e);
    }
    tracing::debug!("successful initial ping from Redis");

    let shutdown = CancellationToken::new();
    let relay = Arc::new(Relay::new(
        config.relay_listen_address(),
        config.store_address(),
    ));
    let discovery = Arc::new(ServiceDiscovery::new(
        client.clone(),
        &config.namespace,
        config.leader_service.clone(),
    ));
    let coordinator = Coordinator::new(
        config.clone(),
        Arc::new(store),
        discovery,
        Arc::clone(&relay),
        shutdown.clone(),
    );

    // The election loop runs in parallel and serializes its outcomes
    // into events; the dispatch loop below is the only consumer.
    let (events_tx, mut events_rx) = mpsc::channel(16);
    let election = LeaseElection::new(client, &config, events_tx);
    let election_task = tokio::spawn(election.run(shutdown.clone()));

    let mut sigterm = signal(SignalKind::terminate())?;

    let result = loop {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received interrupt, shutting down");
                break Ok(());
            }
            _ = shutdown.cancelled() => {
                break Err(Error::Aborted);
            }
            event = events_rx.recv() => match event {
                Some(event) => {
                    if let Err(e) = coordinator.handle_event(event).await {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            }
        }
    };

    // Unwind election participation and close the relay; in-flight
    // relayed connections are dropped, clients reconnect and re-resolve.
    shutdown.cancel();
    let _ = relay.stop().await;
    let _ = election_task.await;

    tracing::info!("redlead shutdown complete");
    result
}
