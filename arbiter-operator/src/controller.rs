//! Arbitration controller.
//!
//! Each cycle works from a fresh snapshot of the cluster state cache:
//!
//! 1. Compute the deserved share of every queue with the configured allocation policy.
//! 2. Publish each share as the hard limits of the queue's quota object, where it changed.
//! 3. Report deserved, allocated & used values on the queue's status, where they changed.
//! 4. Tear down quota objects whose queue no longer exists.
//! 5. Preempt workloads from queues which use more than they deserve.
//!
//! Cycles are triggered by cluster changes observed by the cache, and at a fixed interval
//! otherwise. Only the leader runs cycles. Failures within a cycle are logged & counted, and
//! whatever failed is retried on the next cycle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use futures::prelude::*;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::cache::{CacheHandle, PublishedQuota, QueueInfo, Snapshot};
use crate::config::Config;
use crate::k8s::coordination::LeaderState;
use crate::k8s::ControlPlane;
use crate::policy::AllocationPolicy;
use crate::preemption::{PreemptionReport, Preemptor};
use arbiter_core::crd::QueueStatus;
use arbiter_core::ResourceVector;

const METRIC_CYCLES: &str = "arbiter_cycles";
const METRIC_CYCLE_ERRORS: &str = "arbiter_cycle_errors";
const METRIC_CYCLE_SECONDS: &str = "arbiter_cycle_seconds";
const METRIC_QUOTA_PUBLISHES: &str = "arbiter_quota_publishes";

/// The outcome of a single arbitration cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleReport {
    /// The number of quota objects applied.
    pub quotas_published: usize,
    /// The number of orphaned quota objects deleted.
    pub quotas_deleted: usize,
    /// The number of queue statuses updated.
    pub statuses_updated: usize,
    /// The number of failed control plane calls, excluding evictions.
    pub errors: usize,
    pub preemption: PreemptionReport,
}

/// The arbitration controller task.
pub struct Controller {
    /// Runtime config.
    config: Arc<Config>,
    /// A handle to the cluster state cache.
    cache: CacheHandle,
    /// The policy used to compute deserved shares.
    policy: Arc<dyn AllocationPolicy>,
    /// The control plane used for all writes.
    control_plane: Arc<dyn ControlPlane>,
    preemptor: Preemptor,
    /// The leadership state of this replica.
    leader: watch::Receiver<LeaderState>,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, cache: CacheHandle, policy: Arc<dyn AllocationPolicy>, control_plane: Arc<dyn ControlPlane>, leader: watch::Receiver<LeaderState>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        metrics::register_counter!(METRIC_CYCLES, metrics::Unit::Count, "arbitration cycles executed");
        metrics::register_counter!(METRIC_CYCLE_ERRORS, metrics::Unit::Count, "failed control plane calls during arbitration cycles");
        metrics::register_counter!(METRIC_QUOTA_PUBLISHES, metrics::Unit::Count, "quota objects applied");
        metrics::register_histogram!(METRIC_CYCLE_SECONDS, metrics::Unit::Seconds, "duration of arbitration cycles");
        Self {
            config,
            cache,
            policy,
            preemptor: Preemptor::new(control_plane.clone()),
            control_plane,
            leader,
            shutdown: BroadcastStream::new(shutdown),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!(policy = self.policy.name(), "arbitration controller started");
        let mut interval = tokio::time::interval(self.config.reconcile_interval());
        let mut changes = self.cache.changes();
        let debounce = self.config.reconcile_debounce();

        loop {
            tokio::select! {
                _ = interval.tick() => (),
                Ok(()) = changes.changed() => {
                    // Fold bursts of cluster changes into a single cycle.
                    if !debounce.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(debounce) => (),
                            _ = self.shutdown.next() => break,
                        }
                    }
                }
                _ = self.shutdown.next() => break,
            }

            let is_leader = matches!(*self.leader.borrow(), LeaderState::Leading);
            if !is_leader {
                tracing::trace!("not the leader, skipping arbitration cycle");
                continue;
            }
            let report = self.reconcile().await;
            tracing::debug!(?report, "arbitration cycle complete");
        }

        tracing::info!("arbitration controller shutdown");
        Ok(())
    }

    /// Run a single arbitration cycle.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn reconcile(&mut self) -> CycleReport {
        let start = Instant::now();
        let mut report = CycleReport::default();

        // Snapshot.
        let mut snapshot = self.cache.snapshot().await;

        // Compute shares.
        let weights: BTreeMap<String, u32> = snapshot.queues.iter().map(|(ns, queue)| (ns.clone(), queue.weight())).collect();
        let shares = self.policy.compute(&weights, &snapshot.capacity);
        for (ns, queue) in snapshot.queues.iter_mut() {
            queue.set_deserved(shares.get(ns).copied().unwrap_or_default());
        }

        // Publish quotas & update queue statuses.
        let Snapshot { queues, quotas, .. } = &mut snapshot;
        for queue in queues.values_mut() {
            let key = (queue.namespace().to_string(), queue.name().to_string());
            let allocated = self.publish_quota(queue, quotas.get(&key), &mut report).await;
            queue.set_allocated(allocated);
            self.update_status(queue, &mut report).await;
        }

        // Tear down orphaned quotas.
        for (namespace, name) in quotas.keys() {
            let owned = queues.get(namespace).map(|queue| queue.name() == name).unwrap_or(false);
            if owned {
                continue;
            }
            match self.control_plane.delete_quota(namespace, name).await {
                Ok(()) => report.quotas_deleted += 1,
                Err(err) => {
                    tracing::error!(error = ?err, %namespace, %name, "error deleting orphaned resource quota");
                    report.errors += 1;
                }
            }
        }

        // Preempt.
        report.preemption = self.preemptor.reconcile_preemption(&snapshot).await;

        metrics::increment_counter!(METRIC_CYCLES);
        if report.errors > 0 {
            metrics::counter!(METRIC_CYCLE_ERRORS, report.errors as u64);
        }
        metrics::histogram!(METRIC_CYCLE_SECONDS, start.elapsed().as_secs_f64());
        report
    }

    /// Publish the deserved share of the queue as its quota, returning the capacity now reserved.
    async fn publish_quota(&self, queue: &QueueInfo, published: Option<&PublishedQuota>, report: &mut CycleReport) -> ResourceVector {
        let deserved = *queue.deserved();
        if published.map(|quota| quota.enforces(&deserved)).unwrap_or(false) {
            return deserved;
        }
        match self.control_plane.apply_quota(queue.namespace(), queue.name(), &deserved).await {
            Ok(()) => {
                metrics::increment_counter!(METRIC_QUOTA_PUBLISHES);
                report.quotas_published += 1;
                deserved
            }
            Err(err) => {
                tracing::error!(error = ?err, namespace = queue.namespace(), queue = queue.name(), "error publishing resource quota");
                report.errors += 1;
                published.map(PublishedQuota::reserved).unwrap_or_default().min(&deserved)
            }
        }
    }

    /// Write the current values of the queue to its status, if they changed.
    async fn update_status(&self, queue: &QueueInfo, report: &mut CycleReport) {
        if status_matches(queue) {
            return;
        }
        let status = QueueStatus::new(queue.deserved(), queue.allocated(), queue.used());
        match self.control_plane.patch_queue_status(queue.namespace(), queue.name(), &status).await {
            Ok(()) => report.statuses_updated += 1,
            Err(err) => {
                tracing::error!(error = ?err, namespace = queue.namespace(), queue = queue.name(), "error updating queue status");
                report.errors += 1;
            }
        }
    }
}

/// True if the status last written to the queue matches its current values.
///
/// Values are compared after parsing, so that equivalent quantity spellings are not rewritten.
fn status_matches(queue: &QueueInfo) -> bool {
    let status = match queue.queue().status.as_ref() {
        Some(status) => status,
        None => return false,
    };
    status.deserved().ok().as_ref() == Some(queue.deserved())
        && status.allocated().ok().as_ref() == Some(queue.allocated())
        && status.used().ok().as_ref() == Some(queue.used())
}
