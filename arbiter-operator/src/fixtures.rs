use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use k8s_openapi::api::core::v1::{Container, Node, NodeCondition, NodeSpec, NodeStatus, Pod, PodSpec, PodStatus, ResourceQuota, ResourceQuotaSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use kube::runtime::watcher::Event;

use crate::cache::ClusterState;
use crate::k8s::{quota_hard_limits, set_canonical_labels, ControlPlane};
use arbiter_core::crd::{Queue, QueueSpec, QueueStatus};
use arbiter_core::ResourceVector;

/// The base timestamp of all test objects.
pub fn epoch() -> DateTime<Utc> {
    Utc.ymd(2021, 6, 1).and_hms(0, 0, 0)
}

fn resource_list(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    let mut list = BTreeMap::new();
    list.insert("cpu".into(), Quantity(cpu.into()));
    list.insert("memory".into(), Quantity(memory.into()));
    list
}

/// Build a ready node with the given allocatable resources.
pub fn node(name: &str, cpu: &str, memory: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        status: Some(NodeStatus {
            allocatable: Some(resource_list(cpu, memory)),
            capacity: Some(resource_list(cpu, memory)),
            conditions: Some(vec![NodeCondition {
                type_: "Ready".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Build a running pod with a single container requesting the given resources.
///
/// `age_secs` is the offset of the pod's creation from the test epoch, so larger values are
/// younger pods.
pub fn pod(namespace: &str, name: &str, cpu: &str, memory: &str, age_secs: i64) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            uid: Some(format!("{}-{}-uid", namespace, name)),
            creation_timestamp: Some(Time(epoch() + Duration::seconds(age_secs))),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container(name, cpu, memory)],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".into()),
            ..Default::default()
        }),
    }
}

/// Build a container requesting the given resources.
pub fn container(name: &str, cpu: &str, memory: &str) -> Container {
    Container {
        name: name.into(),
        resources: Some(ResourceRequirements {
            requests: Some(resource_list(cpu, memory)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build a queue with the given weight.
pub fn queue(namespace: &str, name: &str, weight: Option<u32>) -> Queue {
    let mut queue = Queue::new(name, QueueSpec { weight });
    queue.metadata.namespace = Some(namespace.into());
    queue
}

/// Build a queue carrying the given status.
pub fn queue_with_status(namespace: &str, name: &str, weight: Option<u32>, status: QueueStatus) -> Queue {
    let mut queue = queue(namespace, name, weight);
    queue.status = Some(status);
    queue
}

/// Build a quota object as published by the operator for the given share.
pub fn quota(namespace: &str, name: &str, share: &ResourceVector) -> ResourceQuota {
    let mut labels = BTreeMap::new();
    set_canonical_labels(&mut labels);
    ResourceQuota {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some(quota_hard_limits(share)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build a cluster state from the given objects.
pub fn cluster_state(nodes: Vec<Node>, queues: Vec<Queue>, pods: Vec<Pod>) -> ClusterState {
    let mut state = ClusterState::default();
    state.handle_node_event(Event::Restarted(nodes));
    state.handle_pod_event(Event::Restarted(pods));
    state.handle_queue_event(Event::Restarted(queues));
    state
}

/// A call recorded by the `RecordingControlPlane`.
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    ApplyQuota { namespace: String, name: String, share: ResourceVector },
    DeleteQuota { namespace: String, name: String },
    PatchQueueStatus { namespace: String, name: String, status: QueueStatus },
    TerminateWorkload { namespace: String, name: String },
}

/// A control plane which records all calls made to it.
///
/// Calls targeting an object named in `failing` return an error, and are still recorded.
#[derive(Default)]
pub struct RecordingControlPlane {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingControlPlane {
    /// Make all calls targeting the named object fail.
    pub fn fail_on(&self, name: &str) {
        self.failing.lock().expect("failing set lock poisoned").insert(name.into());
    }

    /// Take all calls recorded so far.
    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().expect("calls lock poisoned"))
    }

    fn record(&self, name: &str, call: Call) -> Result<()> {
        self.calls.lock().expect("calls lock poisoned").push(call);
        if self.failing.lock().expect("failing set lock poisoned").contains(name) {
            bail!("injected failure for {}", name);
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for RecordingControlPlane {
    async fn apply_quota(&self, namespace: &str, name: &str, share: &ResourceVector) -> Result<()> {
        self.record(
            name,
            Call::ApplyQuota {
                namespace: namespace.into(),
                name: name.into(),
                share: *share,
            },
        )
    }

    async fn delete_quota(&self, namespace: &str, name: &str) -> Result<()> {
        self.record(
            name,
            Call::DeleteQuota {
                namespace: namespace.into(),
                name: name.into(),
            },
        )
    }

    async fn patch_queue_status(&self, namespace: &str, name: &str, status: &QueueStatus) -> Result<()> {
        self.record(
            name,
            Call::PatchQueueStatus {
                namespace: namespace.into(),
                name: name.into(),
                status: status.clone(),
            },
        )
    }

    async fn terminate_workload(&self, namespace: &str, name: &str) -> Result<()> {
        self.record(
            name,
            Call::TerminateWorkload {
                namespace: namespace.into(),
                name: name.into(),
            },
        )
    }
}
