//! Workload & node accounting derived from K8s objects.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Container, Node, Pod};
use kube::Resource;

use arbiter_core::ResourceVector;

const POD_PHASE_SUCCEEDED: &str = "Succeeded";
const POD_PHASE_FAILED: &str = "Failed";
const NODE_CONDITION_READY: &str = "Ready";

/// A schedulable unit of work which consumes resources on behalf of a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadInfo {
    pub name: String,
    pub namespace: String,
    /// The UID of the pod, distinguishing it from later pods of the same name.
    pub uid: String,
    /// The effective resource request of this workload.
    pub requests: ResourceVector,
    /// The pod's scheduling priority, `0` when unset.
    pub priority: i32,
    pub created: Option<DateTime<Utc>>,
}

impl WorkloadInfo {
    /// Build a workload from the given pod.
    ///
    /// Returns `None` when the pod no longer consumes resources: it has reached a terminal phase
    /// or is being deleted. Such pods must not count towards their queue's usage.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let meta = pod.meta();
        let (name, namespace) = match (meta.name.as_ref(), meta.namespace.as_ref()) {
            (Some(name), Some(namespace)) => (name, namespace),
            _ => return None, // Not actually possible as K8s requires both.
        };
        if meta.deletion_timestamp.is_some() {
            return None;
        }
        let phase = pod.status.as_ref().and_then(|status| status.phase.as_deref());
        if matches!(phase, Some(POD_PHASE_SUCCEEDED) | Some(POD_PHASE_FAILED)) {
            return None;
        }
        Some(Self {
            name: name.clone(),
            namespace: namespace.clone(),
            uid: meta.uid.clone().unwrap_or_else(|| format!("{}/{}", namespace, name)),
            requests: pod_requests(pod),
            priority: pod.spec.as_ref().and_then(|spec| spec.priority).unwrap_or(0),
            created: meta.creation_timestamp.as_ref().map(|ts| ts.0),
        })
    }
}

/// Compute the effective resource request of a pod.
///
/// This follows the K8s scheduler: per dimension, the larger of the sum of all app container
/// requests and the largest single init container request.
pub fn pod_requests(pod: &Pod) -> ResourceVector {
    let spec = match pod.spec.as_ref() {
        Some(spec) => spec,
        None => return ResourceVector::default(),
    };
    let containers: ResourceVector = spec.containers.iter().map(container_requests).sum();
    let init = spec
        .init_containers
        .iter()
        .flatten()
        .map(container_requests)
        .fold(ResourceVector::default(), |acc, req| acc.max(&req));
    containers.max(&init)
}

fn container_requests(container: &Container) -> ResourceVector {
    let requests = match container.resources.as_ref().and_then(|res| res.requests.as_ref()) {
        Some(requests) => requests,
        None => return ResourceVector::default(),
    };
    ResourceVector::from_resource_list(requests)
        .unwrap_or_else(|err| {
            tracing::warn!(error = ?err, container = %container.name, "malformed container resource requests, counting as zero");
            ResourceVector::default()
        })
        .clamp_non_negative()
}

/// The capacity contribution of a single node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub allocatable: ResourceVector,
    /// True when the node is ready & accepts new pods.
    pub schedulable: bool,
}

impl NodeInfo {
    pub fn from_node(node: &Node) -> Self {
        let status = node.status.as_ref();
        let ready = status
            .and_then(|status| status.conditions.as_ref())
            .map(|conds| conds.iter().any(|cond| cond.type_ == NODE_CONDITION_READY && cond.status == "True"))
            .unwrap_or(false);
        let cordoned = node.spec.as_ref().and_then(|spec| spec.unschedulable).unwrap_or(false);
        let allocatable = status
            .and_then(|status| status.allocatable.as_ref().or_else(|| status.capacity.as_ref()))
            .map(|resources| {
                ResourceVector::from_resource_list(resources).unwrap_or_else(|err| {
                    tracing::warn!(error = ?err, node = ?node.meta().name, "malformed node allocatable resources, counting as zero");
                    ResourceVector::default()
                })
            })
            .unwrap_or_default()
            .clamp_non_negative();
        Self {
            allocatable,
            schedulable: ready && !cordoned,
        }
    }

    /// The capacity this node contributes to the cluster.
    pub fn capacity(&self) -> ResourceVector {
        if self.schedulable {
            self.allocatable
        } else {
            ResourceVector::default()
        }
    }
}
