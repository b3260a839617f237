//! Three-node failover scenario.
//!
//! Simulates pods A, B and C sharing one election outcome stream. The
//! election layer is driven by hand; the store and discovery
//! collaborators are recording fakes, while each node runs a real TCP
//! relay on an ephemeral port.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use redlead::config::{Config, ConfigOptions};
use redlead::coordinator::Coordinator;
use redlead::discovery::DiscoveryPublisher;
use redlead::election::LeaderEvent;
use redlead::error::Result;
use redlead::relay::{Relay, RelayState};
use redlead::store::StoreControl;

#[derive(Default)]
struct RecordingStore {
    directives: Mutex<Vec<String>>,
}

#[async_trait]
impl StoreControl for RecordingStore {
    async fn replicate_from(&self, host: &str, port: u16) -> Result<()> {
        self.directives
            .lock()
            .unwrap()
            .push(format!("replicate-from {}:{}", host, port));
        Ok(())
    }

    async fn become_primary(&self) -> Result<()> {
        self.directives
            .lock()
            .unwrap()
            .push("become-primary".to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingDiscovery {
    published: Mutex<Vec<String>>,
}

#[async_trait]
impl DiscoveryPublisher for RecordingDiscovery {
    async fn publish_primary(&self, identity: &str) -> Result<()> {
        self.published.lock().unwrap().push(identity.to_string());
        Ok(())
    }
}

struct Node {
    coordinator: Coordinator,
    store: Arc<RecordingStore>,
    discovery: Arc<RecordingDiscovery>,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
}

impl Node {
    fn new(identity: &str) -> Self {
        let config = Config::resolve(
            ConfigOptions {
                leader_service: Some("redis-leader".into()),
                lock_name: Some("redis-lock".into()),
                redis_port: None,
                relay_port: None,
                cluster_domain: None,
                headless_service: Some("redis-headless".into()),
            },
            "default".into(),
            identity.into(),
        )
        .unwrap();

        let store = Arc::new(RecordingStore::default());
        let discovery = Arc::new(RecordingDiscovery::default());
        let relay = Arc::new(Relay::new(
            "127.0.0.1:0".to_string(),
            "127.0.0.1:1".to_string(),
        ));
        let shutdown = CancellationToken::new();
        let coordinator = Coordinator::new(
            config,
            Arc::clone(&store) as Arc<dyn StoreControl>,
            Arc::clone(&discovery) as Arc<dyn DiscoveryPublisher>,
            Arc::clone(&relay),
            shutdown.clone(),
        );

        Self {
            coordinator,
            store,
            discovery,
            relay,
            shutdown,
        }
    }

    async fn handle(&self, event: LeaderEvent) {
        self.coordinator.handle_event(event).await.unwrap();
    }

    fn directives(&self) -> Vec<String> {
        self.store.directives.lock().unwrap().clone()
    }
}

fn peer(identity: &str) -> String {
    format!("{}.redis-headless.default.svc.cluster.local:6379", identity)
}

#[tokio::test]
async fn test_three_node_failover() {
    let a = Node::new("pod-a");
    let b = Node::new("pod-b");
    let c = Node::new("pod-c");

    // A wins the first election.
    a.handle(LeaderEvent::Acquired).await;
    a.handle(LeaderEvent::Observed("pod-a".into())).await;
    b.handle(LeaderEvent::Observed("pod-a".into())).await;
    c.handle(LeaderEvent::Observed("pod-a".into())).await;

    assert_eq!(*a.discovery.published.lock().unwrap(), vec!["pod-a"]);
    assert_eq!(a.directives(), vec!["become-primary"]);
    assert_eq!(a.relay.state().await, RelayState::Running);

    assert_eq!(b.directives(), vec![format!("replicate-from {}", peer("pod-a"))]);
    assert_eq!(c.directives(), vec![format!("replicate-from {}", peer("pod-a"))]);
    assert_eq!(b.relay.state().await, RelayState::Stopped);
    assert_eq!(c.relay.state().await, RelayState::Stopped);

    // A's lease expires; leadership moves to B.
    a.handle(LeaderEvent::Lost).await;
    b.handle(LeaderEvent::Acquired).await;
    b.handle(LeaderEvent::Observed("pod-b".into())).await;
    a.handle(LeaderEvent::Observed("pod-b".into())).await;
    c.handle(LeaderEvent::Observed("pod-b".into())).await;

    assert_eq!(a.relay.state().await, RelayState::Stopped);
    assert_eq!(b.relay.state().await, RelayState::Running);
    assert_eq!(*b.discovery.published.lock().unwrap(), vec!["pod-b"]);

    assert_eq!(
        a.directives(),
        vec![
            "become-primary".to_string(),
            format!("replicate-from {}", peer("pod-b")),
        ]
    );
    assert_eq!(
        b.directives(),
        vec![
            format!("replicate-from {}", peer("pod-a")),
            "become-primary".to_string(),
        ]
    );
    assert_eq!(
        c.directives(),
        vec![
            format!("replicate-from {}", peer("pod-a")),
            format!("replicate-from {}", peer("pod-b")),
        ]
    );

    // No node aborted its run during a clean failover.
    assert!(!a.shutdown.is_cancelled());
    assert!(!b.shutdown.is_cancelled());
    assert!(!c.shutdown.is_cancelled());
}
