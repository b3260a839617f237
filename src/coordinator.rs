//! Replication Coordinator
//!
//! Reacts to election events by driving the store control channel, the
//! discovery publisher and the leader relay through the correct
//! sequence. These are control-plane actions with no safe partial
//! state, so every failure during a transition is fatal to the run:
//! the process-wide cancellation fires, the process exits and the
//! platform restarts it into a clean election.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::discovery::DiscoveryPublisher;
use crate::election::LeaderEvent;
use crate::error::Result;
use crate::relay::Relay;
use crate::store::StoreControl;

/// Coordinates store role, discovery record and relay lifecycle.
pub struct Coordinator {
    config: Config,
    store: Arc<dyn StoreControl>,
    discovery: Arc<dyn DiscoveryPublisher>,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(
        config: Config,
        store: Arc<dyn StoreControl>,
        discovery: Arc<dyn DiscoveryPublisher>,
        relay: Arc<Relay>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            discovery,
            relay,
            shutdown,
        }
    }

    /// Single dispatch point for election events. Any handler failure
    /// cancels the whole coordination run before being returned.
    pub async fn handle_event(&self, event: LeaderEvent) -> Result<()> {
        let result = match event {
            LeaderEvent::Acquired => self.on_acquired().await,
            LeaderEvent::Lost => self.on_lost().await,
            LeaderEvent::Observed(identity) => self.on_observed(&identity).await,
        };
        if result.is_err() {
            self.shutdown.cancel();
        }
        result
    }

    /// Promotion sequence: discovery first so no client is told to
    /// reach a node that still replicates someone else, then the store
    /// role change, then the relay. The relay is monitored for the rest
    /// of the term; an asynchronous relay failure after promotion is
    /// unrecoverable locally and aborts the run.
    async fn on_acquired(&self) -> Result<()> {
        tracing::info!("leadership acquired, promoting local store to primary");

        if let Err(e) = self.discovery.publish_primary(&self.config.identity).await {
            tracing::error!(
                "failed to update leader service {}: {}",
                self.config.leader_service,
                e
            );
            return Err(e);
        }

        if let Err(e) = self.store.become_primary().await {
            tracing::error!("failed to remove replication config from local store: {}", e);
            return Err(e);
        }

        if let Err(e) = self.relay.start().await {
            tracing::error!("failed to start leader relay: {}", e);
            return Err(e);
        }

        let relay = Arc::clone(&self.relay);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.wait().await {
                tracing::error!("leader relay failed: {}", e);
                shutdown.cancel();
            }
        });

        tracing::info!(
            "started leader relay on {}",
            self.config.relay_listen_address()
        );
        Ok(())
    }

    /// Demotion: stop the relay so stale clients cannot keep reaching
    /// a node that no longer owns primary status. An un-stoppable
    /// relay is a correctness violation and fails the run.
    async fn on_lost(&self) -> Result<()> {
        tracing::info!("leadership lost, stopping leader relay");
        if let Err(e) = self.relay.stop().await {
            tracing::error!("failed to stop leader relay: {}", e);
            return Err(e);
        }
        Ok(())
    }

    /// A leader was observed. For anyone but ourselves, attach the
    /// local store as a replica of the leader's pod-DNS address.
    async fn on_observed(&self, identity: &str) -> Result<()> {
        if identity == self.config.identity {
            tracing::debug!("observed ourselves as leader");
            return Ok(());
        }

        let peer = self.config.peer_address(identity);
        tracing::info!("observed new leader {}, replicating from {}", identity, peer);
        if let Err(e) = self
            .store
            .replicate_from(&peer, self.config.redis_port)
            .await
        {
            tracing::error!("failed to replicate new leader {}: {}", peer, e);
            return Err(e);
        }
        Ok(())
    }
}
