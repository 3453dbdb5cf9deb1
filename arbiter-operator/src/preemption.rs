//! Preemption engine.
//!
//! When a queue uses more than it deserves, workloads are evicted from it until its usage fits
//! within its share again. Victims are chosen per queue: the least important & most recently
//! started workloads go first, and a workload is only chosen if it frees resources on a dimension
//! which is still over the share.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{QueueInfo, Snapshot, WorkloadInfo};
use crate::k8s::ControlPlane;
use arbiter_core::ResourceVector;

const METRIC_EVICTIONS: &str = "arbiter_evictions";
const METRIC_EVICTION_FAILURES: &str = "arbiter_eviction_failures";

/// The duration for which an evicted workload is considered gone, even while the cache still
/// reports it as live.
const EVICTION_GRACE: Duration = Duration::from_secs(120);

/// The outcome of a preemption pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PreemptionReport {
    /// Workloads successfully terminated, as `(namespace, name)`.
    pub evicted: Vec<(String, String)>,
    /// Workloads which could not be terminated, as `(namespace, name)`.
    pub failed: Vec<(String, String)>,
    /// Namespaces of queues which are still over their share after this pass.
    pub unresolved: Vec<String>,
}

/// Select the workloads to evict from the given queue so that its usage fits its deserved share.
///
/// Returns an empty set when the queue is within its share.
pub fn select_victims(queue: &QueueInfo) -> Vec<WorkloadInfo> {
    let mut excess = (*queue.used() - *queue.deserved()).clamp_non_negative();
    if !excess.any_positive() {
        return vec![];
    }

    let mut candidates: Vec<&WorkloadInfo> = queue.workloads().values().collect();
    candidates.sort_by(|a, b| victim_order(a, b));

    let mut victims = vec![];
    for candidate in candidates {
        if !excess.any_positive() {
            break;
        }
        if !frees_excess(&excess, &candidate.requests) {
            continue;
        }
        excess = (excess - candidate.requests).clamp_non_negative();
        victims.push(candidate.clone());
    }
    victims
}

/// Eviction order: lowest priority first, then most recently created, then name descending.
fn victim_order(a: &WorkloadInfo, b: &WorkloadInfo) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| b.created.cmp(&a.created))
        .then_with(|| b.name.cmp(&a.name))
}

/// True if the given request frees resources on a dimension which still has excess.
fn frees_excess(excess: &ResourceVector, requests: &ResourceVector) -> bool {
    (excess.cpu > 0 && requests.cpu > 0) || (excess.memory > 0 && requests.memory > 0)
}

/// Drives eviction of workloads from queues which are over their share.
pub struct Preemptor {
    control_plane: Arc<dyn ControlPlane>,
    /// Workloads terminated recently, keyed by pod UID, which the cache may not have observed
    /// as gone yet.
    pending: HashMap<String, Instant>,
}

impl Preemptor {
    /// Create a new instance.
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        metrics::register_counter!(METRIC_EVICTIONS, metrics::Unit::Count, "workloads evicted from queues over their share");
        metrics::register_counter!(METRIC_EVICTION_FAILURES, metrics::Unit::Count, "failed workload evictions");
        Self {
            control_plane,
            pending: Default::default(),
        }
    }

    /// Evict workloads from every queue of the snapshot whose usage exceeds its deserved share.
    ///
    /// The deserved shares of the snapshot's queues must already be current. A failure to evict
    /// one workload does not stop the remaining evictions.
    #[tracing::instrument(level = "debug", skip(self, snapshot))]
    pub async fn reconcile_preemption(&mut self, snapshot: &Snapshot) -> PreemptionReport {
        self.prune_pending(snapshot);
        let mut report = PreemptionReport::default();
        for queue in snapshot.queues.values() {
            let queue = self.without_pending(queue);
            if queue.used_under_deserved() {
                continue;
            }

            let victims = select_victims(&queue);
            tracing::info!(
                namespace = queue.namespace(),
                queue = queue.name(),
                used = %queue.used(),
                deserved = %queue.deserved(),
                victims = victims.len(),
                "queue is over its deserved share, preempting workloads"
            );
            let mut freed = ResourceVector::default();
            for victim in victims {
                let key = (victim.namespace.clone(), victim.name.clone());
                match self.control_plane.terminate_workload(&victim.namespace, &victim.name).await {
                    Ok(()) => {
                        metrics::increment_counter!(METRIC_EVICTIONS, "namespace" => victim.namespace.clone());
                        freed += victim.requests;
                        self.pending.insert(victim.uid.clone(), Instant::now());
                        report.evicted.push(key);
                    }
                    Err(err) => {
                        tracing::error!(error = ?err, namespace = %victim.namespace, name = %victim.name, "error evicting workload");
                        metrics::increment_counter!(METRIC_EVICTION_FAILURES, "namespace" => victim.namespace.clone());
                        report.failed.push(key);
                    }
                }
            }

            if !(*queue.used() - freed).is_under(queue.deserved()) {
                tracing::warn!(namespace = queue.namespace(), queue = queue.name(), "queue remains over its deserved share after preemption");
                report.unresolved.push(queue.namespace().to_string());
            }
        }
        report
    }

    /// Drop pending evictions which the cache has caught up with, or which have outlived the grace
    /// period.
    fn prune_pending(&mut self, snapshot: &Snapshot) {
        let live: HashSet<&str> = snapshot
            .queues
            .values()
            .flat_map(|queue| queue.workloads().values())
            .map(|workload| workload.uid.as_str())
            .collect();
        self.pending
            .retain(|uid, evicted_at| live.contains(uid.as_str()) && evicted_at.elapsed() < EVICTION_GRACE);
    }

    /// A copy of the given queue without the workloads already being evicted.
    fn without_pending(&self, queue: &QueueInfo) -> QueueInfo {
        let mut queue = queue.clone();
        let pending: Vec<String> = queue
            .workloads()
            .values()
            .filter(|workload| self.pending.contains_key(&workload.uid))
            .map(|workload| workload.name.clone())
            .collect();
        for name in pending {
            queue.remove_workload(&name);
        }
        queue
    }
}
