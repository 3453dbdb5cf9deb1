//! Kubernetes control plane interactions.
//!
//! All writes performed by the operator flow through the `ControlPlane` trait, so that the
//! arbitration logic can be exercised without a live cluster.
//!
//! Quota objects are written with K8s [Server-Side Apply](https://kubernetes.io/docs/reference/using-api/server-side-apply/)
//! (SSA). A single apply call creates the object or updates the fields owned by this operator,
//! and leaves fields owned by other field managers untouched.

pub mod coordination;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, ResourceQuota, ResourceQuotaSpec};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::{CustomResourceExt, Resource};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::k8s::coordination::LeaderState;
use arbiter_core::crd::{Queue, QueueStatus};
use arbiter_core::{ResourceVector, LABEL_APP, LABEL_CONTROLLED_BY, OPERATOR_NAME};

/// The default timeout to use for API calls.
pub const API_TIMEOUT: Duration = Duration::from_secs(5);
/// The interval at which a freshly registered CRD is checked for establishment.
const CRD_ESTABLISHED_POLL: Duration = Duration::from_millis(250);

/// Quota hard limit key for requested cpu.
pub const QUOTA_REQUESTS_CPU: &str = "requests.cpu";
/// Quota hard limit key for requested memory.
pub const QUOTA_REQUESTS_MEMORY: &str = "requests.memory";
/// Quota hard limit key for cpu limits.
pub const QUOTA_LIMITS_CPU: &str = "limits.cpu";
/// Quota hard limit key for memory limits.
pub const QUOTA_LIMITS_MEMORY: &str = "limits.memory";

/// The set of write operations the operator performs against the cluster.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create or update the quota object of a queue so that it enforces the given share.
    async fn apply_quota(&self, namespace: &str, name: &str, share: &ResourceVector) -> Result<()>;

    /// Delete a quota object. Deleting an absent object is a success.
    async fn delete_quota(&self, namespace: &str, name: &str) -> Result<()>;

    /// Replace the status of a queue.
    async fn patch_queue_status(&self, namespace: &str, name: &str, status: &QueueStatus) -> Result<()>;

    /// Request termination of a workload. Terminating an absent workload is a success.
    async fn terminate_workload(&self, namespace: &str, name: &str) -> Result<()>;
}

/// A `ControlPlane` backed by the K8s API.
pub struct KubeControlPlane {
    /// K8s client.
    client: Client,
    /// The leadership state of this replica.
    leader: watch::Receiver<LeaderState>,
}

impl KubeControlPlane {
    /// Create a new instance.
    pub fn new(client: Client, leader: watch::Receiver<LeaderState>) -> Self {
        Self { client, leader }
    }

    /// Ensure this replica is the leader, else return an error.
    fn fence(&self) -> Result<()> {
        if !matches!(*self.leader.borrow(), LeaderState::Leading) {
            bail!("lease is no longer held by this pod");
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    #[tracing::instrument(level = "debug", skip(self, share))]
    async fn apply_quota(&self, namespace: &str, name: &str, share: &ResourceVector) -> Result<()> {
        self.fence()?;
        tracing::info!(namespace, name, %share, "applying resource quota");
        let mut labels = BTreeMap::new();
        set_canonical_labels(&mut labels);
        let quota = ResourceQuota {
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
        };
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        let mut params = PatchParams::apply(OPERATOR_NAME);
        params.force = true;
        timeout(API_TIMEOUT, api.patch(name, &params, &Patch::Apply(&quota)))
            .await
            .context("timeout while applying resource quota")?
            .context("error applying resource quota")?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_quota(&self, namespace: &str, name: &str) -> Result<()> {
        self.fence()?;
        tracing::info!(namespace, name, "deleting resource quota");
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        let res = timeout(API_TIMEOUT, api.delete(name, &Default::default()))
            .await
            .context("timeout while deleting resource quota")?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) => match err {
                kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND => Ok(()),
                _ => Err(err).context("error deleting resource quota"),
            },
        }
    }

    #[tracing::instrument(level = "debug", skip(self, status))]
    async fn patch_queue_status(&self, namespace: &str, name: &str, status: &QueueStatus) -> Result<()> {
        self.fence()?;
        tracing::debug!(namespace, name, "patching queue status");
        let api: Api<Queue> = Api::namespaced(self.client.clone(), namespace);
        let body = serde_json::json!({
            "apiVersion": Queue::api_version(&()),
            "kind": Queue::kind(&()),
            "status": status,
        });
        let mut params = PatchParams::apply(OPERATOR_NAME);
        params.force = true;
        timeout(API_TIMEOUT, api.patch_status(name, &params, &Patch::Apply(&body)))
            .await
            .context("timeout while patching queue status")?
            .context("error patching queue status")?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn terminate_workload(&self, namespace: &str, name: &str) -> Result<()> {
        self.fence()?;
        tracing::info!(namespace, name, "terminating workload");
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let res = timeout(API_TIMEOUT, api.delete(name, &Default::default()))
            .await
            .context("timeout while deleting pod")?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) => match err {
                kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND => Ok(()),
                _ => Err(err).context("error deleting pod"),
            },
        }
    }
}

/// Register the Queue CRD with the cluster, and wait for it to be established.
///
/// A CRD which is already registered is left untouched.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn ensure_queue_crd(client: Client) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let crd = Queue::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();
    let res = timeout(API_TIMEOUT, api.create(&PostParams::default(), &crd))
        .await
        .context("timeout while registering Queue CRD")?;
    match res {
        Ok(_val) => tracing::info!("registered Queue CRD"),
        Err(err) => match err {
            kube::Error::Api(api_err) if api_err.code == http::StatusCode::CONFLICT => {
                tracing::debug!("Queue CRD already registered");
            }
            _ => return Err(err).context("error registering Queue CRD"),
        },
    }

    timeout(API_TIMEOUT, wait_for_crd_established(&api, &name))
        .await
        .context("timeout waiting for Queue CRD to be established")??;
    tracing::debug!("Queue CRD established");
    Ok(())
}

/// Poll the named CRD until it is established.
async fn wait_for_crd_established(api: &Api<CustomResourceDefinition>, name: &str) -> Result<()> {
    loop {
        let crd = api.get(name).await.context("error fetching Queue CRD")?;
        if crd_established(&crd) {
            return Ok(());
        }
        tokio::time::sleep(CRD_ESTABLISHED_POLL).await;
    }
}

/// True if the given CRD has been accepted & is served by the API server.
fn crd_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conds| conds.iter().any(|cond| cond.type_ == "Established" && cond.status == "True"))
        .unwrap_or(false)
}

/// Build the hard limits of a quota object enforcing the given share.
pub fn quota_hard_limits(share: &ResourceVector) -> BTreeMap<String, k8s_openapi::apimachinery::pkg::api::resource::Quantity> {
    let mut hard = share.to_quantities(QUOTA_REQUESTS_CPU, QUOTA_REQUESTS_MEMORY);
    hard.extend(share.to_quantities(QUOTA_LIMITS_CPU, QUOTA_LIMITS_MEMORY));
    hard
}

/// Set the canonical labels on an object controlled by Arbiter.
pub fn set_canonical_labels(labels: &mut BTreeMap<String, String>) {
    labels.insert("app".into(), LABEL_APP.into());
    labels.insert(LABEL_CONTROLLED_BY.into(), OPERATOR_NAME.into());
}

#[cfg(test)]
mod test {
    use super::*;
    use arbiter_core::ARBITER_OPERATOR_LABEL_SELECTORS;
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{CustomResourceDefinitionCondition, CustomResourceDefinitionStatus};

    #[test]
    fn quota_hard_limits_cover_requests_and_limits() {
        let hard = quota_hard_limits(&ResourceVector::new(3_000, 3 << 30));
        let keys: Vec<_> = hard.keys().map(String::as_str).collect();
        assert_eq!(keys, vec![QUOTA_LIMITS_CPU, QUOTA_LIMITS_MEMORY, QUOTA_REQUESTS_CPU, QUOTA_REQUESTS_MEMORY]);

        let limits = ResourceVector::from_quantities(&hard, QUOTA_LIMITS_CPU, QUOTA_LIMITS_MEMORY);
        let requests = ResourceVector::from_quantities(&hard, QUOTA_REQUESTS_CPU, QUOTA_REQUESTS_MEMORY);
        assert_eq!(limits, Ok(ResourceVector::new(3_000, 3 << 30)));
        assert_eq!(requests, Ok(ResourceVector::new(3_000, 3 << 30)));
    }

    #[test]
    fn crd_is_established_once_the_condition_is_true() {
        let mut crd = Queue::crd();
        assert!(!crd_established(&crd), "expected a CRD without status to not be established");

        let condition = |type_: &str, status: &str| CustomResourceDefinitionCondition {
            type_: type_.into(),
            status: status.into(),
            ..Default::default()
        };
        crd.status = Some(CustomResourceDefinitionStatus {
            conditions: Some(vec![condition("NamesAccepted", "True"), condition("Established", "False")]),
            ..Default::default()
        });
        assert!(!crd_established(&crd), "expected a CRD pending establishment to not be established");

        crd.status = Some(CustomResourceDefinitionStatus {
            conditions: Some(vec![condition("NamesAccepted", "True"), condition("Established", "True")]),
            ..Default::default()
        });
        assert!(crd_established(&crd), "expected CRD to be established");
    }

    #[test]
    fn canonical_labels_match_selector() {
        let mut labels = BTreeMap::new();
        set_canonical_labels(&mut labels);
        let selector = labels.iter().map(|(key, val)| format!("{}={}", key, val)).collect::<Vec<_>>().join(",");
        assert!(
            selector == ARBITER_OPERATOR_LABEL_SELECTORS,
            "unexpected label selector, got {}, expected {}",
            selector,
            ARBITER_OPERATOR_LABEL_SELECTORS
        );
    }
}
