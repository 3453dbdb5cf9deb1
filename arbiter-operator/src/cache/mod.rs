//! Cluster state cache.
//!
//! The cache observes nodes, queues, pods & the operator's quota objects in K8s, and maintains
//! the accounting data the arbitration controller works from: total cluster capacity, the queue
//! of each tenant namespace along with its member workloads, and the quota hard limits which
//! have been published so far.
//!
//! A single task applies watcher events to the state under a write lock. Readers only ever
//! observe the state through deep-copied snapshots.

mod data;
mod queue_info;
mod workload;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::prelude::*;
use k8s_openapi::api::core::v1::{Node, Pod, ResourceQuota};
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::k8s::API_TIMEOUT;
use arbiter_core::crd::Queue;
use arbiter_core::{ResourceVector, ARBITER_OPERATOR_LABEL_SELECTORS};
pub use queue_info::QueueInfo;
pub use workload::{pod_requests, NodeInfo, WorkloadInfo};

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

const METRIC_CAPACITY_CPU: &str = "arbiter_cluster_capacity_cpu_millis";
const METRIC_CAPACITY_MEMORY: &str = "arbiter_cluster_capacity_memory_bytes";
const METRIC_QUEUES: &str = "arbiter_queues";
const METRIC_WATCHER_ERRORS: &str = "arbiter_watcher_errors";

/// The delay applied after a watcher error before polling the watcher again.
const WATCHER_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// The hard limits of a quota object published by the operator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishedQuota {
    pub name: String,
    pub namespace: String,
    /// The `requests.*` hard limits.
    pub requests: ResourceVector,
    /// The `limits.*` hard limits.
    pub limits: ResourceVector,
}

impl PublishedQuota {
    /// True if this quota enforces exactly the given share.
    pub fn enforces(&self, share: &ResourceVector) -> bool {
        &self.requests == share && &self.limits == share
    }

    /// The capacity effectively reserved by this quota.
    pub fn reserved(&self) -> ResourceVector {
        self.requests.min(&self.limits)
    }
}

/// A point-in-time, deep copy of the cluster state.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    /// Total capacity of all ready & schedulable nodes.
    pub capacity: ResourceVector,
    /// All live queues, keyed by namespace.
    pub queues: BTreeMap<String, QueueInfo>,
    /// All published quotas, keyed by `(namespace, name)`.
    pub quotas: BTreeMap<(String, String), PublishedQuota>,
}

/// The cluster state maintained by the cache.
#[derive(Debug, Default)]
pub struct ClusterState {
    /// All known nodes, keyed by name.
    nodes: HashMap<String, NodeInfo>,
    /// The sum of the capacity of all known nodes.
    capacity: ResourceVector,
    /// The queue of each tenant namespace, keyed by namespace.
    queues: BTreeMap<String, QueueInfo>,
    /// Queues which lost the race for their namespace, keyed by `(namespace, name)`.
    shadowed_queues: BTreeMap<(String, String), Queue>,
    /// All live workloads, keyed by namespace and then by name.
    ///
    /// This index is independent of queue membership so that a queue created after its
    /// workloads can be seeded with them.
    workloads: HashMap<String, BTreeMap<String, WorkloadInfo>>,
    /// All published quotas, keyed by `(namespace, name)`.
    quotas: BTreeMap<(String, String), PublishedQuota>,
}

impl ClusterState {
    /// Take a deep copy of the current state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            capacity: self.capacity,
            queues: self.queues.clone(),
            quotas: self.quotas.clone(),
        }
    }

    /// The total capacity of all ready & schedulable nodes.
    pub fn capacity(&self) -> &ResourceVector {
        &self.capacity
    }

    /// The queue owning the given namespace, if any.
    pub fn queue(&self, namespace: &str) -> Option<&QueueInfo> {
        self.queues.get(namespace)
    }

    pub fn queues(&self) -> &BTreeMap<String, QueueInfo> {
        &self.queues
    }

    pub fn quotas(&self) -> &BTreeMap<(String, String), PublishedQuota> {
        &self.quotas
    }
}

/// A handle to the cluster state cache.
#[derive(Clone)]
pub struct CacheHandle {
    state: Arc<RwLock<ClusterState>>,
    changes: watch::Receiver<u64>,
}

impl CacheHandle {
    /// Take a deep copy of the current cluster state.
    pub async fn snapshot(&self) -> Snapshot {
        self.state.read().await.snapshot()
    }

    /// A channel which is updated with a new generation each time the cluster state changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.clone()
    }

    /// Build a handle over the given state, detached from any K8s watchers.
    #[cfg(test)]
    pub fn new_test(state: ClusterState) -> (Self, watch::Sender<u64>) {
        let (tx, rx) = watch::channel(0);
        (
            Self {
                state: Arc::new(RwLock::new(state)),
                changes: rx,
            },
            tx,
        )
    }

    /// Mutate the state behind this handle.
    #[cfg(test)]
    pub async fn update<F: FnOnce(&mut ClusterState)>(&self, f: F) {
        let mut state = self.state.write().await;
        f(&mut state);
    }
}

/// The task which ingests K8s watcher events into the cluster state.
pub struct ClusterCache {
    /// K8s client.
    client: Client,
    /// The cluster state, shared with all cache handles.
    state: Arc<RwLock<ClusterState>>,
    /// The channel used to signal state changes.
    changes: watch::Sender<u64>,
    /// The current change generation.
    generation: u64,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,
}

impl ClusterCache {
    /// Create a new instance.
    pub fn new(client: Client, shutdown: broadcast::Receiver<()>) -> (Self, CacheHandle) {
        let state = Arc::new(RwLock::new(ClusterState::default()));
        let (changes_tx, changes_rx) = watch::channel(0);
        let handle = CacheHandle {
            state: state.clone(),
            changes: changes_rx,
        };
        let cache = Self {
            client,
            state,
            changes: changes_tx,
            generation: 0,
            shutdown: BroadcastStream::new(shutdown),
        };
        (cache, handle)
    }

    /// Establish the initial cluster state from a point-in-time listing of all objects of interest.
    ///
    /// Any error here is fatal, as the operator must never arbitrate based on partial data.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn bootstrap(&mut self) -> Result<()> {
        let params = ListParams::default();
        let nodes = tokio::time::timeout(API_TIMEOUT, Api::<Node>::all(self.client.clone()).list(&params))
            .await
            .context("timeout while listing nodes")?
            .context("error listing nodes")?;
        let queues = tokio::time::timeout(API_TIMEOUT, Api::<Queue>::all(self.client.clone()).list(&params))
            .await
            .context("timeout while listing queues")?
            .context("error listing queues")?;
        let pods = tokio::time::timeout(API_TIMEOUT, Api::<Pod>::all(self.client.clone()).list(&params))
            .await
            .context("timeout while listing pods")?
            .context("error listing pods")?;
        let quotas = tokio::time::timeout(API_TIMEOUT, Api::<ResourceQuota>::all(self.client.clone()).list(&Self::list_params_controlled()))
            .await
            .context("timeout while listing resource quotas")?
            .context("error listing resource quotas")?;

        {
            let mut state = self.state.write().await;
            state.handle_node_event(Event::Restarted(nodes.items));
            state.handle_pod_event(Event::Restarted(pods.items));
            state.handle_queue_event(Event::Restarted(queues.items));
            state.handle_quota_event(Event::Restarted(quotas.items));
            tracing::info!(
                capacity = %state.capacity(),
                queues = state.queues().len(),
                quotas = state.quotas().len(),
                "cluster state cache bootstrapped"
            );
        }
        self.notify();
        Ok(())
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("cluster state cache started");
        let params = ListParams::default();
        let nodes_watcher = watcher(Api::<Node>::all(self.client.clone()), params.clone());
        let queues_watcher = watcher(Api::<Queue>::all(self.client.clone()), params.clone());
        let pods_watcher = watcher(Api::<Pod>::all(self.client.clone()), params);
        let quotas_watcher = watcher(Api::<ResourceQuota>::all(self.client.clone()), Self::list_params_controlled());
        tokio::pin!(nodes_watcher, queues_watcher, pods_watcher, quotas_watcher);

        loop {
            let healthy = tokio::select! {
                Some(res) = nodes_watcher.next() => self.handle_event(res, "Node", ClusterState::handle_node_event).await,
                Some(res) = queues_watcher.next() => self.handle_event(res, "Queue", ClusterState::handle_queue_event).await,
                Some(res) = pods_watcher.next() => self.handle_event(res, "Pod", ClusterState::handle_pod_event).await,
                Some(res) = quotas_watcher.next() => self.handle_event(res, "ResourceQuota", ClusterState::handle_quota_event).await,
                _ = self.shutdown.next() => break,
            };
            if !healthy && !watcher_backoff(&mut self.shutdown, WATCHER_ERROR_BACKOFF).await {
                break;
            }
        }

        tracing::debug!("cluster state cache shutdown");
        Ok(())
    }

    /// Apply a watcher event to the cluster state & notify observers.
    ///
    /// Returns `false` if the watcher yielded an error, in which case it should be backed off.
    async fn handle_event<K>(&mut self, res: EventResult<K>, kind: &'static str, apply: fn(&mut ClusterState, Event<K>)) -> bool {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, kind, "error from k8s watcher");
                metrics::increment_counter!(METRIC_WATCHER_ERRORS, "kind" => kind);
                return false;
            }
        };
        {
            let mut state = self.state.write().await;
            apply(&mut state, event);
        }
        self.notify();
        true
    }

    fn notify(&mut self) {
        self.generation += 1;
        let _ = self.changes.send(self.generation);
    }

    /// List params selecting only objects controlled by this operator.
    fn list_params_controlled() -> ListParams {
        ListParams {
            label_selector: Some(ARBITER_OPERATOR_LABEL_SELECTORS.into()),
            ..Default::default()
        }
    }
}

/// Wait out a watcher error backoff, returning `false` if shutdown was signalled first.
pub async fn watcher_backoff(shutdown: &mut BroadcastStream<()>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.next() => false,
    }
}

/// Register the metrics of the cache.
pub fn register_metrics() {
    metrics::register_gauge!(METRIC_CAPACITY_CPU, metrics::Unit::Count, "total cpu capacity of ready & schedulable nodes, in millicores");
    metrics::register_gauge!(METRIC_CAPACITY_MEMORY, metrics::Unit::Bytes, "total memory capacity of ready & schedulable nodes");
    metrics::register_gauge!(METRIC_QUEUES, metrics::Unit::Count, "number of live queues");
    metrics::register_counter!(METRIC_WATCHER_ERRORS, metrics::Unit::Count, "errors observed from k8s watchers");
}
