use k8s_openapi::api::core::v1::{Node, Pod, ResourceQuota};
use kube::runtime::watcher::Event;
use kube::Resource;

use crate::cache::{ClusterState, NodeInfo, PublishedQuota, QueueInfo, WorkloadInfo, METRIC_CAPACITY_CPU, METRIC_CAPACITY_MEMORY, METRIC_QUEUES};
use crate::k8s::{QUOTA_LIMITS_CPU, QUOTA_LIMITS_MEMORY, QUOTA_REQUESTS_CPU, QUOTA_REQUESTS_MEMORY};
use arbiter_core::crd::{Queue, RequiredMetadata};
use arbiter_core::ResourceVector;

//////////////////////////////////////////////////////////////////////////////
// Node Events ///////////////////////////////////////////////////////////////
impl ClusterState {
    /// Handle `Node` watcher event.
    #[tracing::instrument(level = "debug", skip(self, event))]
    pub fn handle_node_event(&mut self, event: Event<Node>) {
        match event {
            Event::Applied(obj) => self.node_applied(obj),
            Event::Deleted(obj) => self.node_deleted(obj),
            Event::Restarted(objs) => self.nodes_restarted(objs),
        }
        self.recompute_capacity();
    }

    fn node_applied(&mut self, node: Node) {
        let name = match node.meta().name.as_ref() {
            Some(name) => name,
            None => return, // Not actually possible as K8s requires name.
        };
        self.nodes.insert(name.clone(), NodeInfo::from_node(&node));
    }

    fn node_deleted(&mut self, node: Node) {
        if let Some(name) = node.meta().name.as_ref() {
            self.nodes.remove(name);
        }
    }

    fn nodes_restarted(&mut self, nodes: Vec<Node>) {
        self.nodes.clear();
        for node in nodes {
            self.node_applied(node);
        }
    }

    fn recompute_capacity(&mut self) {
        let capacity: ResourceVector = self.nodes.values().map(NodeInfo::capacity).sum();
        if capacity != self.capacity {
            tracing::info!(old = %self.capacity, new = %capacity, "cluster capacity changed");
        }
        self.capacity = capacity;
        metrics::gauge!(METRIC_CAPACITY_CPU, capacity.cpu as f64);
        metrics::gauge!(METRIC_CAPACITY_MEMORY, capacity.memory as f64);
    }
}

//////////////////////////////////////////////////////////////////////////////
// Pod Events ////////////////////////////////////////////////////////////////
impl ClusterState {
    /// Handle `Pod` watcher event.
    #[tracing::instrument(level = "debug", skip(self, event))]
    pub fn handle_pod_event(&mut self, event: Event<Pod>) {
        match event {
            Event::Applied(obj) => self.pod_applied(obj),
            Event::Deleted(obj) => self.pod_deleted(obj),
            Event::Restarted(objs) => self.pods_restarted(objs),
        }
    }

    fn pod_applied(&mut self, pod: Pod) {
        match WorkloadInfo::from_pod(&pod) {
            Some(workload) => self.workload_upserted(workload),
            // Terminal & terminating pods no longer consume their queue's share.
            None => self.pod_deleted(pod),
        }
    }

    fn pod_deleted(&mut self, pod: Pod) {
        let meta = pod.meta();
        if let (Some(name), Some(namespace)) = (meta.name.as_ref(), meta.namespace.as_ref()) {
            self.workload_removed(namespace, name);
        }
    }

    fn pods_restarted(&mut self, pods: Vec<Pod>) {
        self.workloads.clear();
        self.queues.values_mut().for_each(QueueInfo::clear_workloads);
        for pod in pods {
            self.pod_applied(pod);
        }
    }

    fn workload_upserted(&mut self, workload: WorkloadInfo) {
        if let Some(queue) = self.queues.get_mut(&workload.namespace) {
            queue.add_workload(workload.clone());
        }
        self.workloads
            .entry(workload.namespace.clone())
            .or_default()
            .insert(workload.name.clone(), workload);
    }

    fn workload_removed(&mut self, namespace: &str, name: &str) {
        if let Some(queue) = self.queues.get_mut(namespace) {
            queue.remove_workload(name);
        }
        if let Some(table) = self.workloads.get_mut(namespace) {
            table.remove(name);
            if table.is_empty() {
                self.workloads.remove(namespace);
            }
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Queue Events //////////////////////////////////////////////////////////////
impl ClusterState {
    /// Handle `Queue` watcher event.
    #[tracing::instrument(level = "debug", skip(self, event))]
    pub fn handle_queue_event(&mut self, event: Event<Queue>) {
        match event {
            Event::Applied(obj) => self.queue_applied(obj),
            Event::Deleted(obj) => self.queue_deleted(obj),
            Event::Restarted(objs) => self.queues_restarted(objs),
        }
        metrics::gauge!(METRIC_QUEUES, self.queues.len() as f64);
    }

    fn queue_applied(&mut self, queue: Queue) {
        let (namespace, name) = (queue.namespace().to_string(), queue.name().to_string());
        if namespace.is_empty() || name.is_empty() {
            return; // Not actually possible as Queues are namespaced.
        }
        if let Err(err) = queue.validate() {
            tracing::warn!(error = %err, %namespace, queue = %name, weight = queue.weight(), "invalid queue, using its effective weight");
        }
        match self.queues.get_mut(&namespace) {
            Some(existing) if existing.name() == name => existing.set_queue(queue),
            Some(existing) => {
                tracing::warn!(%namespace, queue = %name, owner = existing.name(), "namespace is already owned by another queue, ignoring queue");
                self.shadowed_queues.insert((namespace, name), queue);
            }
            None => {
                self.shadowed_queues.remove(&(namespace.clone(), name));
                self.queue_claimed(namespace, queue);
            }
        }
    }

    fn queue_deleted(&mut self, queue: Queue) {
        let (namespace, name) = (queue.namespace(), queue.name());
        if self.shadowed_queues.remove(&(namespace.to_string(), name.to_string())).is_some() {
            return;
        }
        let owned = self.queues.get(namespace).map(|existing| existing.name() == name).unwrap_or(false);
        if !owned {
            return;
        }
        self.queues.remove(namespace);

        // Hand the namespace over to the next queue waiting for it, if any.
        let next = self.shadowed_queues.keys().find(|(ns, _)| ns == namespace).cloned();
        if let Some(key) = next {
            if let Some(queue) = self.shadowed_queues.remove(&key) {
                tracing::info!(namespace = %key.0, queue = %key.1, "namespace ownership handed over to queue");
                self.queue_claimed(key.0, queue);
            }
        }
    }

    fn queues_restarted(&mut self, queues: Vec<Queue>) {
        self.queues.clear();
        self.shadowed_queues.clear();
        for queue in queues {
            self.queue_applied(queue);
        }
    }

    /// Register the given queue as the owner of its namespace, seeding its membership.
    fn queue_claimed(&mut self, namespace: String, queue: Queue) {
        let mut info = QueueInfo::new(queue);
        for workload in self.workloads.get(&namespace).into_iter().flat_map(|table| table.values()) {
            info.add_workload(workload.clone());
        }
        self.queues.insert(namespace, info);
    }
}

//////////////////////////////////////////////////////////////////////////////
// ResourceQuota Events //////////////////////////////////////////////////////
impl ClusterState {
    /// Handle `ResourceQuota` watcher event.
    #[tracing::instrument(level = "debug", skip(self, event))]
    pub fn handle_quota_event(&mut self, event: Event<ResourceQuota>) {
        match event {
            Event::Applied(obj) => self.quota_applied(obj),
            Event::Deleted(obj) => self.quota_deleted(obj),
            Event::Restarted(objs) => {
                self.quotas.clear();
                for obj in objs {
                    self.quota_applied(obj);
                }
            }
        }
    }

    fn quota_applied(&mut self, quota: ResourceQuota) {
        let meta = quota.meta();
        let (name, namespace) = match (meta.name.as_ref(), meta.namespace.as_ref()) {
            (Some(name), Some(namespace)) => (name.clone(), namespace.clone()),
            _ => return, // Not actually possible as K8s requires both.
        };
        let (requests, limits) = match quota.spec.as_ref().and_then(|spec| spec.hard.as_ref()) {
            Some(hard) => {
                let parse = |cpu_key, memory_key| {
                    ResourceVector::from_quantities(hard, cpu_key, memory_key).unwrap_or_else(|err| {
                        tracing::warn!(error = ?err, %namespace, quota = %name, "malformed hard limits in resource quota, counting as zero");
                        ResourceVector::default()
                    })
                };
                (parse(QUOTA_REQUESTS_CPU, QUOTA_REQUESTS_MEMORY), parse(QUOTA_LIMITS_CPU, QUOTA_LIMITS_MEMORY))
            }
            None => Default::default(),
        };
        let published = PublishedQuota {
            name: name.clone(),
            namespace: namespace.clone(),
            requests,
            limits,
        };
        self.quotas.insert((namespace, name), published);
    }

    fn quota_deleted(&mut self, quota: ResourceQuota) {
        let meta = quota.meta();
        if let (Some(name), Some(namespace)) = (meta.name.as_ref(), meta.namespace.as_ref()) {
            self.quotas.remove(&(namespace.clone(), name.clone()));
        }
    }
}
