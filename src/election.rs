//! Leader Election Client
//!
//! Participates in a distributed election by acquiring and renewing a
//! Kubernetes Lease. Mutual exclusion is provided by the API server's
//! optimistic concurrency on the Lease object; this module only runs
//! the acquire/renew loop and turns the observed outcomes into
//! explicit `LeaderEvent`s consumed by the coordinator.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::PostParams;
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};

/// Election outcome events, serialized by the election loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderEvent {
    /// This node just won the election.
    Acquired,
    /// This node stopped being leader, voluntarily or by lease expiry.
    Lost,
    /// Someone (possibly self) is now leader.
    Observed(String),
}

/// Election timing, matching the Kubernetes client-go defaults the
/// original sidecar deployments were tuned for.
#[derive(Debug, Clone)]
pub struct ElectionTiming {
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// How long the holder keeps retrying renewal before giving up
    pub renew_deadline: Duration,
    /// Pause between acquire/renew attempts
    pub retry_period: Duration,
}

impl Default for ElectionTiming {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// Derives causally ordered `LeaderEvent`s from the holder identity
/// reported by each acquire/renew round.
///
/// Guarantees: `Acquired` always precedes `Observed(self)`; a holder
/// change away from self emits `Lost` before the new `Observed`.
struct EventTracker {
    identity: String,
    leading: bool,
    observed: Option<String>,
}

impl EventTracker {
    fn new(identity: String) -> Self {
        Self {
            identity,
            leading: false,
            observed: None,
        }
    }

    fn leading(&self) -> bool {
        self.leading
    }

    /// Record the holder seen in one round and emit the transitions.
    fn record(&mut self, holder: &str) -> Vec<LeaderEvent> {
        let mut events = Vec::new();
        if holder == self.identity {
            if !self.leading {
                self.leading = true;
                events.push(LeaderEvent::Acquired);
            }
        } else if self.leading {
            self.leading = false;
            events.push(LeaderEvent::Lost);
        }
        if self.observed.as_deref() != Some(holder) {
            self.observed = Some(holder.to_string());
            events.push(LeaderEvent::Observed(holder.to_string()));
        }
        events
    }

    /// The renew deadline passed without a successful round.
    fn renew_failed(&mut self) -> Option<LeaderEvent> {
        if self.leading {
            self.leading = false;
            Some(LeaderEvent::Lost)
        } else {
            None
        }
    }
}

/// Lease-based election participant.
pub struct LeaseElection {
    api: Api<Lease>,
    lock_name: String,
    identity: String,
    timing: ElectionTiming,
    events: mpsc::Sender<LeaderEvent>,
}

impl LeaseElection {
    pub fn new(client: Client, config: &Config, events: mpsc::Sender<LeaderEvent>) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            lock_name: config.lock_name.clone(),
            identity: config.identity.clone(),
            timing: ElectionTiming::default(),
            events,
        }
    }

    /// Run the acquire/renew loop until cancelled.
    ///
    /// Transient API errors are retried here and never surface as
    /// events; a renew failure only becomes `Lost` once the renew
    /// deadline has passed while leading.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut tracker = EventTracker::new(self.identity.clone());
        let mut last_round = Instant::now();
        let mut ticker = tokio::time::interval(self.timing.retry_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("election loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.try_acquire_or_renew().await {
                Ok(holder) => {
                    last_round = Instant::now();
                    for event in tracker.record(&holder) {
                        if self.events.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("lease acquire/renew attempt failed: {}", e);
                    if tracker.leading() && last_round.elapsed() >= self.timing.renew_deadline {
                        tracing::error!(
                            "failed to renew lease {} within {:?}, giving up leadership",
                            self.lock_name,
                            self.timing.renew_deadline
                        );
                        if let Some(event) = tracker.renew_failed() {
                            if self.events.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// One acquire/renew round. Returns the lease holder after the
    /// round, which is self when acquisition or renewal succeeded.
    async fn try_acquire_or_renew(&self) -> Result<String> {
        let now = MicroTime(Utc::now());

        let Some(mut lease) = self.api.get_opt(&self.lock_name).await? else {
            let lease = self.fresh_lease(now, 1);
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => {
                    tracing::info!("created lease {} as holder", self.lock_name);
                    Ok(self.identity.clone())
                }
                Err(kube::Error::Api(resp)) if resp.code == 409 => {
                    Err(Error::Election("lease was created concurrently".into()))
                }
                Err(e) => Err(e.into()),
            };
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let holder = spec.holder_identity.clone().unwrap_or_default();

        if holder == self.identity {
            // Renew our own lease.
            lease.spec = Some(LeaseSpec {
                renew_time: Some(now),
                ..spec
            });
            self.api
                .replace(&self.lock_name, &PostParams::default(), &lease)
                .await?;
            return Ok(self.identity.clone());
        }

        if holder.is_empty() || lease_expired(&spec, Utc::now()) {
            // Take over an expired or unheld lease. The replace call
            // carries the fetched resourceVersion, so a concurrent
            // takeover by another candidate fails with a conflict.
            let transitions = spec.lease_transitions.unwrap_or(0) + 1;
            lease.spec = Some(self.held_spec(now, transitions));
            return match self
                .api
                .replace(&self.lock_name, &PostParams::default(), &lease)
                .await
            {
                Ok(_) => {
                    tracing::info!("acquired expired lease {} from {:?}", self.lock_name, holder);
                    Ok(self.identity.clone())
                }
                Err(kube::Error::Api(resp)) if resp.code == 409 => {
                    Err(Error::Election("lost lease takeover race".into()))
                }
                Err(e) => Err(e.into()),
            };
        }

        Ok(holder)
    }

    fn held_spec(&self, now: MicroTime, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.timing.lease_duration.as_secs() as i32),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    fn fresh_lease(&self, now: MicroTime, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lock_name.clone()),
                ..Default::default()
            },
            spec: Some(self.held_spec(now, transitions)),
        }
    }
}

/// Whether the lease's last renewal is older than its duration.
fn lease_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    let Some(renewed) = spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) else {
        return true;
    };
    let duration = chrono::Duration::seconds(i64::from(spec.lease_duration_seconds.unwrap_or(15)));
    now > renewed.0 + duration
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquired_precedes_observed_self() {
        let mut tracker = EventTracker::new("pod-0".into());
        let events = tracker.record("pod-0");
        assert_eq!(
            events,
            vec![LeaderEvent::Acquired, LeaderEvent::Observed("pod-0".into())]
        );
    }

    #[test]
    fn test_renewal_emits_nothing() {
        let mut tracker = EventTracker::new("pod-0".into());
        tracker.record("pod-0");
        assert!(tracker.record("pod-0").is_empty());
    }

    #[test]
    fn test_lost_precedes_observed_other() {
        let mut tracker = EventTracker::new("pod-0".into());
        tracker.record("pod-0");
        let events = tracker.record("pod-1");
        assert_eq!(
            events,
            vec![LeaderEvent::Lost, LeaderEvent::Observed("pod-1".into())]
        );
    }

    #[test]
    fn test_follower_only_observes_holder_changes() {
        let mut tracker = EventTracker::new("pod-2".into());
        assert_eq!(
            tracker.record("pod-0"),
            vec![LeaderEvent::Observed("pod-0".into())]
        );
        assert!(tracker.record("pod-0").is_empty());
        assert_eq!(
            tracker.record("pod-1"),
            vec![LeaderEvent::Observed("pod-1".into())]
        );
    }

    #[test]
    fn test_renew_failure_only_while_leading() {
        let mut tracker = EventTracker::new("pod-0".into());
        assert_eq!(tracker.renew_failed(), None);
        tracker.record("pod-0");
        assert_eq!(tracker.renew_failed(), Some(LeaderEvent::Lost));
        assert_eq!(tracker.renew_failed(), None);
    }

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        let spec = LeaseSpec {
            holder_identity: Some("pod-1".into()),
            lease_duration_seconds: Some(15),
            renew_time: Some(MicroTime(now - chrono::Duration::seconds(30))),
            ..Default::default()
        };
        assert!(lease_expired(&spec, now));

        let spec = LeaseSpec {
            holder_identity: Some("pod-1".into()),
            lease_duration_seconds: Some(15),
            renew_time: Some(MicroTime(now - chrono::Duration::seconds(5))),
            ..Default::default()
        };
        assert!(!lease_expired(&spec, now));

        // No timestamps at all counts as expired.
        assert!(lease_expired(&LeaseSpec::default(), now));
    }
}
