use std::collections::BTreeMap;

use arbiter_core::crd::{Queue, RequiredMetadata};
use arbiter_core::ResourceVector;

use crate::cache::workload::WorkloadInfo;

/// The in-memory accounting record of a tenant queue.
///
/// Cloning a `QueueInfo` produces a fully independent copy, including the queue object and its
/// workload membership table.
#[derive(Clone, Debug)]
pub struct QueueInfo {
    queue: Queue,
    deserved: ResourceVector,
    allocated: ResourceVector,
    used: ResourceVector,
    /// Member workloads, keyed by pod name.
    workloads: BTreeMap<String, WorkloadInfo>,
}

impl QueueInfo {
    /// Create a new record from the given queue object.
    ///
    /// The deserved & allocated vectors are seeded from the last status written to the queue, so
    /// that reporting is stable across operator restarts. Membership starts empty.
    pub fn new(queue: Queue) -> Self {
        let (deserved, allocated) = status_vectors(&queue);
        Self {
            queue,
            deserved,
            allocated,
            used: ResourceVector::default(),
            workloads: Default::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn namespace(&self) -> &str {
        self.queue.namespace()
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// The effective weight of this queue.
    pub fn weight(&self) -> u32 {
        self.queue.weight()
    }

    pub fn deserved(&self) -> &ResourceVector {
        &self.deserved
    }

    pub fn allocated(&self) -> &ResourceVector {
        &self.allocated
    }

    /// The sum of the requests of all member workloads.
    pub fn used(&self) -> &ResourceVector {
        &self.used
    }

    pub fn workloads(&self) -> &BTreeMap<String, WorkloadInfo> {
        &self.workloads
    }

    /// True if used is within allocated on every dimension.
    pub fn used_under_allocated(&self) -> bool {
        self.used.is_under(&self.allocated)
    }

    /// True if used is within deserved on every dimension.
    pub fn used_under_deserved(&self) -> bool {
        self.used.is_under(&self.deserved)
    }

    pub fn set_deserved(&mut self, deserved: ResourceVector) {
        self.deserved = deserved;
    }

    pub fn set_allocated(&mut self, allocated: ResourceVector) {
        self.allocated = allocated;
    }

    /// Replace the queue object backing this record, preserving membership.
    pub fn set_queue(&mut self, queue: Queue) {
        let (deserved, allocated) = status_vectors(&queue);
        self.deserved = deserved;
        self.allocated = allocated;
        self.queue = queue;
    }

    /// Add the given workload to this queue, replacing any previous record of the same name.
    pub fn add_workload(&mut self, workload: WorkloadInfo) {
        self.used += workload.requests;
        if let Some(old) = self.workloads.insert(workload.name.clone(), workload) {
            self.used -= old.requests;
        }
    }

    /// Remove the named workload from this queue.
    pub fn remove_workload(&mut self, name: &str) -> Option<WorkloadInfo> {
        let old = self.workloads.remove(name)?;
        self.used -= old.requests;
        Some(old)
    }

    /// Drop all member workloads.
    pub fn clear_workloads(&mut self) {
        self.workloads.clear();
        self.used = ResourceVector::default();
    }
}

/// Parse the deserved & allocated vectors of a queue's status, zero where absent or malformed.
fn status_vectors(queue: &Queue) -> (ResourceVector, ResourceVector) {
    let status = match queue.status.as_ref() {
        Some(status) => status,
        None => return Default::default(),
    };
    let deserved = status.deserved().unwrap_or_else(|err| {
        tracing::warn!(error = ?err, queue = queue.name(), namespace = queue.namespace(), "malformed deserved value in queue status");
        ResourceVector::default()
    });
    let allocated = status.allocated().unwrap_or_else(|err| {
        tracing::warn!(error = ?err, queue = queue.name(), namespace = queue.namespace(), "malformed allocated value in queue status");
        ResourceVector::default()
    });
    (deserved, allocated)
}
