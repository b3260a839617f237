//! Discovery Publisher
//!
//! Points the leader Service at the pod currently holding leadership,
//! so clients resolving the Service always reach the primary.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

use crate::error::Result;

/// Selector label that pins a Service to a single StatefulSet pod.
const POD_NAME_SELECTOR: &str = "statefulset.kubernetes.io/pod-name";

/// Seam towards the cluster's service discovery record.
#[async_trait]
pub trait DiscoveryPublisher: Send + Sync {
    /// Atomically update the discovery record to resolve to the given
    /// primary identity.
    async fn publish_primary(&self, identity: &str) -> Result<()>;
}

/// Discovery publisher backed by a Kubernetes Service selector.
pub struct ServiceDiscovery {
    api: Api<Service>,
    service_name: String,
}

impl ServiceDiscovery {
    pub fn new(client: Client, namespace: &str, service_name: String) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            service_name,
        }
    }
}

#[async_trait]
impl DiscoveryPublisher for ServiceDiscovery {
    async fn publish_primary(&self, identity: &str) -> Result<()> {
        tracing::debug!("setting leader service selector to pod {}", identity);
        // Targeted merge patch: only the selector changes, unrelated
        // Service metadata written by other controllers stays intact.
        let patch = serde_json::json!({
            "spec": {
                "selector": {
                    POD_NAME_SELECTOR: identity,
                }
            }
        });
        self.api
            .patch(
                &self.service_name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}
