//! Redlead - Leader-Election Sidecar for Replicated Redis
//!
//! A sidecar process that makes a replicated Redis instance highly
//! available inside a Kubernetes cluster by binding its primary/replica
//! role to the outcome of a Lease-based leader election.
//!
//! # Architecture
//!
//! One sidecar runs next to every Redis pod of a StatefulSet. All
//! sidecars compete for a single Kubernetes Lease; the winner promotes
//! its local Redis to primary, points the leader Service at itself and
//! starts a TCP relay so external clients can always connect to "the
//! primary" without knowing which pod that is. Everyone else attaches
//! their local Redis as a replica of the current leader.
//!
//! # Features
//!
//! - Lease-based leader election with automatic failover
//! - Atomic Redis role changes (replication target + client eviction)
//! - Leader Service selector patching for client discovery
//! - Byte-level TCP relay to the current primary
//! - Fail-fast error handling: fatal transitions abort the process and
//!   let the platform restart it into a clean election

pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod election;
pub mod error;
pub mod relay;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
