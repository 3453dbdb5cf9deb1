//! Leader election built around the `coordination.k8s.io/v1` `Lease` API.
//!
//! Only the replica holding the lease runs arbitration cycles. Lease updates are written with
//! optimistic concurrency (the `resourceVersion` of the last observed lease), so two candidates
//! racing for an expired lease can never both succeed.
//!
//! Expiry is judged against the local time at which a change to the lease was last observed,
//! rather than the renew time recorded in the lease, so that clock skew between replicas does not
//! matter. A candidate must observe a full `lease_duration` without any change to the lease before
//! it takes over.

use anyhow::{ensure, Context, Result};
use chrono::{prelude::*, Duration};
use futures::prelude::*;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::client::Client;
use maplit::btreemap;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::k8s::API_TIMEOUT;
use arbiter_core::{LABEL_APP, LABEL_CONTROLLED_BY, OPERATOR_NAME};

type DateTimeUtc = DateTime<Utc>;

/// The name of the lease used by the operator.
pub const LEASE_NAME: &str = "arbiter-operator-leader";

/// The duration which candidates wait between acquisition attempts.
///
/// Core K8s clients default this value to 2 seconds.
const LEASE_RETRY_SECONDS: i64 = 2;

const METRIC_IS_LEADER: &str = "arbiter_operator_is_leader";
const METRIC_LEADERSHIP_CHANGE: &str = "arbiter_operator_num_leadership_changes";

/// Different states which a leader elector may be in.
#[derive(Clone, Debug, PartialEq)]
pub enum LeaderState {
    /// This replica is the leader.
    Leading,
    /// A different replica is currently the leader, identified by the encapsulated string.
    Following(String),
    /// The lease state is unknown, or the elector task is starting or stopping.
    Standby,
}

/// Configuration for leader election.
#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    /// The name of the lease object.
    name: String,
    /// The namespace of the lease object.
    namespace: String,
    /// The identity recorded in the lease when it is held by this replica.
    identity: String,
    /// The duration for which a lease is considered held after its last observed change.
    lease_duration: Duration,
    /// The interval at which the leader renews its lease.
    renew_period: Duration,
    /// The interval at which non-leaders retry acquisition.
    retry_period: Duration,
}

impl LeaderElectionConfig {
    /// Build the election config from the runtime config, validating it.
    pub fn new(config: &Config) -> Result<Self> {
        let lease_duration = Duration::seconds(i64::from(config.lease_duration_seconds));
        let renew_period = Duration::seconds(i64::from(config.lease_renew_seconds));
        let retry_period = Duration::seconds(LEASE_RETRY_SECONDS);
        ensure!(lease_duration > renew_period, "lease duration must be greater than renew period");
        ensure!(renew_period.num_seconds() >= 1, "renew period must be at least 1 second");
        ensure!(!config.pod_name.is_empty(), "POD_NAME must be set for leader election");
        Ok(Self {
            name: LEASE_NAME.into(),
            namespace: config.namespace.clone(),
            identity: config.pod_name.clone(),
            lease_duration,
            renew_period,
            retry_period,
        })
    }
}

/// The action a candidate should take given the last observed lease.
#[derive(Debug, PartialEq)]
enum LeaseAction {
    /// Another replica holds an unexpired lease.
    Follow(String),
    /// The lease is free or expired and may be taken over.
    Acquire,
    /// This replica holds the lease and should renew it.
    Renew,
}

/// Determine the next lease action.
///
/// `observed_at` is the local time at which the last change to the lease was observed.
fn next_action(holder: Option<&str>, identity: &str, observed_at: DateTimeUtc, lease_duration: Duration, now: DateTimeUtc) -> LeaseAction {
    match holder {
        Some(holder) if holder == identity => LeaseAction::Renew,
        Some(holder) if !holder.is_empty() && observed_at + lease_duration > now => LeaseAction::Follow(holder.into()),
        _ => LeaseAction::Acquire,
    }
}

/// A task which acquires & maintains the operator's lease to establish leadership.
pub struct LeaderElector {
    /// A K8s API wrapper around the client.
    api: Api<Lease>,
    /// Leader election config.
    config: LeaderElectionConfig,
    /// Sender for the current leadership state.
    state_tx: watch::Sender<LeaderState>,
    /// The last known leader state.
    state: LeaderState,
    /// A broadcast channel used to trigger task shutdown.
    shutdown: BroadcastStream<()>,

    /// The resource version of the last observed lease.
    last_observed_version: Option<String>,
    /// The last local time at which a change was observed on the lease.
    last_observed_change: DateTimeUtc,
}

impl LeaderElector {
    /// Create a new instance.
    pub fn new(client: Client, config: LeaderElectionConfig, shutdown: broadcast::Receiver<()>) -> (Self, watch::Receiver<LeaderState>) {
        metrics::register_gauge!(METRIC_LEADERSHIP_CHANGE, metrics::Unit::Count, "the number of leadership changes of the operator lease");
        metrics::register_gauge!(
            METRIC_IS_LEADER,
            metrics::Unit::Count,
            "a gauge indicating if this replica is the leader, where 1.0 indicates leadership, any other value does not"
        );
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        (
            Self {
                api: Api::namespaced(client, &config.namespace),
                config,
                state_tx,
                state: LeaderState::Standby,
                shutdown: BroadcastStream::new(shutdown),
                last_observed_version: None,
                last_observed_change: Utc::now(),
            },
            state_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!(lease = %self.config.name, identity = %self.config.identity, "leader elector task started");
        loop {
            if let Err(err) = self.try_acquire_or_renew().await {
                tracing::error!(error = ?err, "error during call to try_acquire_or_renew");
                if !matches!(&self.state, LeaderState::Standby) {
                    self.set_state(LeaderState::Standby);
                }
            }
            let delay = match &self.state {
                LeaderState::Leading => self.config.renew_period,
                _ => self.config.retry_period,
            };
            let delay = delay.to_std().unwrap_or_else(|_| std::time::Duration::from_secs(LEASE_RETRY_SECONDS as u64));
            tokio::select! {
                _ = tokio::time::sleep(delay) => continue,
                _ = self.shutdown.next() => break,
            }
        }

        if matches!(&self.state, LeaderState::Leading) {
            if let Err(err) = self.release().await {
                tracing::error!(error = ?err, "error releasing lease");
            }
        }
        self.set_state(LeaderState::Standby);
        tracing::info!("leader elector task stopped");
    }

    /// Attempt to acquire or renew the lease.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn try_acquire_or_renew(&mut self) -> Result<()> {
        let lease = match self.fetch_lease().await? {
            Some(lease) => lease,
            None => return self.create_lease().await,
        };

        let now = Utc::now();
        if lease.metadata.resource_version != self.last_observed_version {
            self.last_observed_version = lease.metadata.resource_version.clone();
            self.last_observed_change = now;
        }
        let holder = lease.spec.as_ref().and_then(|spec| spec.holder_identity.as_deref());
        let action = next_action(holder, &self.config.identity, self.last_observed_change, self.config.lease_duration, now);
        tracing::debug!(?action, "lease action determined");

        let mut updated = lease.clone();
        let spec = updated.spec.get_or_insert_with(Default::default);
        match action {
            LeaseAction::Follow(holder) => {
                if self.state != LeaderState::Following(holder.clone()) {
                    tracing::info!(%holder, "following lease holder");
                    self.set_state(LeaderState::Following(holder));
                }
                return Ok(());
            }
            LeaseAction::Renew => {
                spec.renew_time = Some(MicroTime(now));
                spec.lease_duration_seconds = Some(self.config.lease_duration.num_seconds() as i32);
            }
            LeaseAction::Acquire => {
                spec.holder_identity = Some(self.config.identity.clone());
                spec.acquire_time = Some(MicroTime(now));
                spec.renew_time = Some(MicroTime(now));
                spec.lease_duration_seconds = Some(self.config.lease_duration.num_seconds() as i32);
                spec.lease_transitions = Some(spec.lease_transitions.map(|val| val + 1).unwrap_or(0));
            }
        }
        updated.metadata.managed_fields = None;

        let res = timeout(API_TIMEOUT, self.api.replace(&self.config.name, &PostParams::default(), &updated))
            .await
            .context("timeout while updating lease")?;
        match res {
            Ok(lease) => {
                self.last_observed_version = lease.metadata.resource_version.clone();
                self.last_observed_change = now;
                if let Some(transitions) = lease.spec.as_ref().and_then(|spec| spec.lease_transitions) {
                    metrics::gauge!(METRIC_LEADERSHIP_CHANGE, transitions as f64);
                }
                if self.state != LeaderState::Leading {
                    tracing::info!("lease acquired, this replica is now the leader");
                    self.set_state(LeaderState::Leading);
                }
                Ok(())
            }
            // Another candidate updated the lease first. It will be observed on the next pass.
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::CONFLICT => {
                tracing::debug!("lost race to update lease");
                if !matches!(&self.state, LeaderState::Standby) {
                    self.set_state(LeaderState::Standby);
                }
                Ok(())
            }
            Err(err) => Err(err).context("error updating lease"),
        }
    }

    /// Fetch the lease, returning `None` if it does not exist.
    async fn fetch_lease(&self) -> Result<Option<Lease>> {
        let res = timeout(API_TIMEOUT, self.api.get(&self.config.name))
            .await
            .context("timeout fetching lease")?;
        match res {
            Ok(lease) => Ok(Some(lease)),
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => Ok(None),
            Err(err) => Err(err).context("error fetching lease"),
        }
    }

    /// Create the lease, held by this replica.
    async fn create_lease(&mut self) -> Result<()> {
        let now = Utc::now();
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.config.name.clone()),
                namespace: Some(self.config.namespace.clone()),
                labels: Some(btreemap! {
                    "app".into() => LABEL_APP.into(),
                    LABEL_CONTROLLED_BY.into() => OPERATOR_NAME.into(),
                }),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.config.identity.clone()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(self.config.lease_duration.num_seconds() as i32),
                lease_transitions: Some(0),
            }),
        };
        let res = timeout(API_TIMEOUT, self.api.create(&PostParams::default(), &lease))
            .await
            .context("timeout creating lease")?;
        match res {
            Ok(lease) => {
                self.last_observed_version = lease.metadata.resource_version.clone();
                self.last_observed_change = now;
                tracing::info!("lease created, this replica is now the leader");
                self.set_state(LeaderState::Leading);
                Ok(())
            }
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::CONFLICT => {
                tracing::debug!("lease created concurrently by another candidate");
                Ok(())
            }
            Err(err) => Err(err).context("error creating lease"),
        }
    }

    /// Release the lease so that another replica may take over without waiting for expiry.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn release(&mut self) -> Result<()> {
        let mut lease = match self.fetch_lease().await? {
            Some(lease) => lease,
            None => return Ok(()),
        };
        let spec = lease.spec.get_or_insert_with(Default::default);
        if spec.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
            return Ok(());
        }
        spec.holder_identity = None;
        spec.acquire_time = None;
        spec.renew_time = None;
        lease.metadata.managed_fields = None;
        timeout(API_TIMEOUT, self.api.replace(&self.config.name, &PostParams::default(), &lease))
            .await
            .context("timeout releasing lease")?
            .context("error releasing lease")?;
        tracing::info!("lease released");
        Ok(())
    }

    /// Set the current leader state & emit a state update.
    fn set_state(&mut self, state: LeaderState) {
        self.state = state;
        let _ = self.state_tx.send(self.state.clone());
        metrics::gauge!(METRIC_IS_LEADER, if matches!(self.state, LeaderState::Leading) { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lease_held_by_self_is_renewed() {
        let now = Utc::now();
        let action = next_action(Some("pod-0"), "pod-0", now - Duration::seconds(600), Duration::seconds(60), now);
        assert_eq!(action, LeaseAction::Renew);
    }

    #[test]
    fn live_lease_held_by_other_is_followed() {
        let now = Utc::now();
        let action = next_action(Some("pod-1"), "pod-0", now - Duration::seconds(30), Duration::seconds(60), now);
        assert_eq!(action, LeaseAction::Follow("pod-1".into()));
    }

    #[test]
    fn expired_or_free_lease_is_acquired() {
        let now = Utc::now();
        let expired = next_action(Some("pod-1"), "pod-0", now - Duration::seconds(61), Duration::seconds(60), now);
        assert_eq!(expired, LeaseAction::Acquire);
        let released = next_action(None, "pod-0", now, Duration::seconds(60), now);
        assert_eq!(released, LeaseAction::Acquire);
        let empty = next_action(Some(""), "pod-0", now, Duration::seconds(60), now);
        assert_eq!(empty, LeaseAction::Acquire);
    }

    #[test]
    fn election_config_requires_renew_below_duration() -> anyhow::Result<()> {
        let mut config = Config::new_test();
        config.lease_duration_seconds = 10;
        config.lease_renew_seconds = 10;
        assert!(LeaderElectionConfig::new(&config).is_err(), "expected election config to be rejected");

        config.lease_renew_seconds = 5;
        let election = LeaderElectionConfig::new(&config)?;
        assert!(election.identity == config.pod_name, "unexpected identity, got {}, expected {}", election.identity, config.pod_name);
        Ok(())
    }
}
