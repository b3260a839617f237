//! Redlead Configuration
//!
//! Startup configuration for the sidecar. Values arrive from the CLI
//! layer as an unvalidated option set and are resolved in a single
//! validation pass that reports every missing field at once.

use std::path::Path;

use crate::error::{Error, Result};

/// Well-known path of the serviceaccount namespace file.
pub const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

const DEFAULT_REDIS_PORT: u16 = 6379;
const DEFAULT_RELAY_PORT: u16 = 6378;
const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Raw option set as collected by the CLI layer, before validation.
#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    /// Name of the Service exposing the current primary
    pub leader_service: Option<String>,
    /// Name of the Kubernetes Lease lock
    pub lock_name: Option<String>,
    /// Port exposed by the local Redis server
    pub redis_port: Option<u16>,
    /// Port this sidecar listens on for primary connections
    pub relay_port: Option<u16>,
    /// Kubernetes cluster domain
    pub cluster_domain: Option<String>,
    /// Headless service attached to the StatefulSet
    pub headless_service: Option<String>,
}

/// Resolved sidecar configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the Service exposing the current primary
    pub leader_service: String,
    /// Name of the Kubernetes Lease lock
    pub lock_name: String,
    /// Port exposed by the local Redis server
    pub redis_port: u16,
    /// Port this sidecar listens on for primary connections
    pub relay_port: u16,
    /// Kubernetes cluster domain
    pub cluster_domain: String,
    /// Headless service attached to the StatefulSet
    pub headless_service: String,
    /// Kubernetes namespace this pod runs in
    pub namespace: String,
    /// Pod hostname, used as election identity and discovery value
    pub identity: String,
}

impl Config {
    /// Resolve the full configuration from CLI options plus the
    /// runtime-derived namespace and identity.
    ///
    /// All missing required fields are collected before failing so the
    /// operator sees the complete list in one pass.
    pub fn resolve(opts: ConfigOptions, namespace: String, identity: String) -> Result<Self> {
        let mut missing = Vec::new();

        let leader_service = required(&mut missing, "leader-service", opts.leader_service);
        let lock_name = required(&mut missing, "lock", opts.lock_name);
        let headless_service = required(&mut missing, "headless-service", opts.headless_service);

        if !missing.is_empty() {
            return Err(Error::MissingConfig(missing.join(", ")));
        }

        let redis_port = opts.redis_port.unwrap_or(DEFAULT_REDIS_PORT);
        if redis_port == 0 {
            return Err(Error::Config("redis-port must be within 1..65535".into()));
        }

        let relay_port = opts.relay_port.unwrap_or(DEFAULT_RELAY_PORT);
        if relay_port == 0 {
            return Err(Error::Config("leader-port must be within 1..65535".into()));
        }

        if namespace.is_empty() {
            return Err(Error::Config("namespace cannot be empty".into()));
        }

        if identity.is_empty() {
            return Err(Error::Config("pod identity cannot be empty".into()));
        }

        Ok(Self {
            leader_service,
            lock_name,
            redis_port,
            relay_port,
            cluster_domain: opts
                .cluster_domain
                .unwrap_or_else(|| DEFAULT_CLUSTER_DOMAIN.to_string()),
            headless_service,
            namespace,
            identity,
        })
    }

    /// Pod-DNS address of a peer, per the StatefulSet naming convention.
    pub fn peer_address(&self, identity: &str) -> String {
        format!(
            "{}.{}.{}.svc.{}",
            identity, self.headless_service, self.namespace, self.cluster_domain
        )
    }

    /// Address of the local Redis server.
    pub fn store_address(&self) -> String {
        format!("127.0.0.1:{}", self.redis_port)
    }

    /// Listen address for the leader relay.
    pub fn relay_listen_address(&self) -> String {
        format!("0.0.0.0:{}", self.relay_port)
    }
}

fn required(missing: &mut Vec<&'static str>, name: &'static str, value: Option<String>) -> String {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => {
            missing.push(name);
            String::new()
        }
    }
}

/// Read the pod namespace from the serviceaccount file, trimmed of
/// surrounding whitespace.
pub fn read_namespace(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read namespace from {}: {}", path.display(), e)))?;
    Ok(raw.trim().to_string())
}

/// Resolve the process hostname, which Kubernetes sets to the pod name.
pub fn hostname() -> Result<String> {
    let name = nix::unistd::gethostname()
        .map_err(|e| Error::Config(format!("unable to determine hostname: {}", e)))?;
    name.into_string()
        .map_err(|_| Error::Config("hostname is not valid UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_options() -> ConfigOptions {
        ConfigOptions {
            leader_service: Some("redis-leader".into()),
            lock_name: Some("redis-lock".into()),
            redis_port: None,
            relay_port: None,
            cluster_domain: None,
            headless_service: Some("redis-headless".into()),
        }
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::resolve(full_options(), "default".into(), "pod-0".into()).unwrap();
        assert_eq!(config.redis_port, 6379);
        assert_eq!(config.relay_port, 6378);
        assert_eq!(config.cluster_domain, "cluster.local");
    }

    #[test]
    fn test_missing_fields_collected() {
        let err = Config::resolve(ConfigOptions::default(), "default".into(), "pod-0".into())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("leader-service"));
        assert!(message.contains("lock"));
        assert!(message.contains("headless-service"));
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut opts = full_options();
        opts.redis_port = Some(0);
        assert!(Config::resolve(opts, "default".into(), "pod-0".into()).is_err());

        let mut opts = full_options();
        opts.relay_port = Some(0);
        assert!(Config::resolve(opts, "default".into(), "pod-0".into()).is_err());
    }

    #[test]
    fn test_peer_address_derivation() {
        let config = Config::resolve(full_options(), "default".into(), "pod-0".into()).unwrap();
        assert_eq!(
            config.peer_address("pod-1"),
            "pod-1.redis-headless.default.svc.cluster.local"
        );
    }

    #[test]
    fn test_empty_namespace_rejected() {
        assert!(Config::resolve(full_options(), "".into(), "pod-0".into()).is_err());
    }
}
