//! Store Control Channel
//!
//! Issues replication role changes to the local Redis instance. Each
//! role change is one atomic MULTI/EXEC batch: set (or clear) the
//! replication target, then evict existing normal and pubsub clients
//! so they re-resolve the primary through discovery instead of keeping
//! stale role assumptions. A failed batch leaves the role unknown and
//! must fail the whole term.

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::error::Result;

/// Command seam towards the local key-value store.
#[async_trait]
pub trait StoreControl: Send + Sync {
    /// Configure the store to replicate from the given primary.
    async fn replicate_from(&self, host: &str, port: u16) -> Result<()>;

    /// Configure the store to stop replicating and accept writes.
    async fn become_primary(&self) -> Result<()>;
}

/// Store control over the local Redis instance.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to the local Redis server. The connection manager
    /// reconnects on its own after transient failures.
    pub async fn connect(port: u16) -> Result<Self> {
        let client = redis::Client::open(format!("redis://127.0.0.1:{}/", port))?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    /// Verify the local store is reachable.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// One atomic role-change batch, mirroring what Redis Sentinel
    /// sends on failover: REPLICAOF plus forced client disconnects.
    async fn set_replica_of(&self, host: &str, port: &str) -> Result<()> {
        tracing::debug!("setting Redis to replicate {} {}", host, port);
        let mut conn = self.conn.clone();
        let _: () = role_change(host, port).query_async(&mut conn).await?;
        Ok(())
    }
}

/// Build the MULTI/EXEC batch for a role change.
fn role_change(host: &str, port: &str) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("REPLICAOF")
        .arg(host)
        .arg(port)
        .ignore()
        .cmd("CLIENT")
        .arg("KILL")
        .arg("TYPE")
        .arg("normal")
        .ignore()
        .cmd("CLIENT")
        .arg("KILL")
        .arg("TYPE")
        .arg("pubsub")
        .ignore();
    pipe
}

#[async_trait]
impl StoreControl for RedisStore {
    async fn replicate_from(&self, host: &str, port: u16) -> Result<()> {
        self.set_replica_of(host, &port.to_string()).await
    }

    async fn become_primary(&self) -> Result<()> {
        self.set_replica_of("NO", "ONE").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_change_batch_is_one_transaction() {
        let packed = role_change("pod-1.redis-headless.default.svc.cluster.local", "6379")
            .get_packed_pipeline();
        let text = String::from_utf8_lossy(&packed);
        assert!(text.contains("MULTI"));
        assert!(text.contains("REPLICAOF"));
        assert!(text.contains("normal"));
        assert!(text.contains("pubsub"));
        assert!(text.contains("EXEC"));
    }

    #[test]
    fn test_become_primary_clears_replication_target() {
        let packed = role_change("NO", "ONE").get_packed_pipeline();
        let text = String::from_utf8_lossy(&packed);
        assert!(text.contains("NO"));
        assert!(text.contains("ONE"));
    }
}
