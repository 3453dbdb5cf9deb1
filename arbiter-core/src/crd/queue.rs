//! Queue CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::resources::ResourceVector;

pub type Queue = QueueCRD; // Mostly to resolve a Rust Analyzer issue.

/// The weight used for queues which do not declare one.
pub const DEFAULT_QUEUE_WEIGHT: u32 = 1;

/// CRD spec for the Queue resource.
///
/// A Queue is the fair-share accounting unit of a tenant namespace. Cluster capacity is split
/// among all live queues in proportion to their weights.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "QueueCRD",
    status = "QueueStatus",
    group = "arbiter.rs",
    version = "v1alpha1",
    kind = "Queue",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "queue",
    printcolumn = r#"{"name":"Weight","type":"integer","jsonPath":".spec.weight"}"#,
    printcolumn = r#"{"name":"Deserved CPU","type":"string","jsonPath":".status.deserved.cpu"}"#,
    printcolumn = r#"{"name":"Used CPU","type":"string","jsonPath":".status.used.cpu"}"#,
    printcolumn = r#"{"name":"Deserved Memory","type":"string","jsonPath":".status.deserved.memory"}"#,
    printcolumn = r#"{"name":"Used Memory","type":"string","jsonPath":".status.used.memory"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct QueueSpec {
    /// The share weight of this queue.
    ///
    /// Defaults to `1` when unset. Must be greater than zero.
    #[serde(default)]
    #[schemars(range(min = 1))]
    pub weight: Option<u32>,
}

/// CRD status object.
///
/// All values are maps of resource name (`cpu`, `memory`) to a K8s quantity string.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// The fair entitlement of this queue, as computed by the allocation policy.
    #[serde(default)]
    pub deserved: BTreeMap<String, String>,
    /// The capacity currently reserved for this queue by its quota object.
    #[serde(default)]
    pub allocated: BTreeMap<String, String>,
    /// The sum of the resource requests of this queue's running workloads.
    #[serde(default)]
    pub used: BTreeMap<String, String>,
}

impl QueueStatus {
    /// Build a new status object from the given vectors.
    pub fn new(deserved: &ResourceVector, allocated: &ResourceVector, used: &ResourceVector) -> Self {
        Self {
            deserved: deserved.to_strings(),
            allocated: allocated.to_strings(),
            used: used.to_strings(),
        }
    }

    /// Parse the deserved vector of this status.
    pub fn deserved(&self) -> Result<ResourceVector, AppError> {
        ResourceVector::from_strings(&self.deserved)
    }

    /// Parse the allocated vector of this status.
    pub fn allocated(&self) -> Result<ResourceVector, AppError> {
        ResourceVector::from_strings(&self.allocated)
    }

    /// Parse the used vector of this status.
    pub fn used(&self) -> Result<ResourceVector, AppError> {
        ResourceVector::from_strings(&self.used)
    }
}

impl Queue {
    /// The effective weight of this queue.
    ///
    /// An unset weight defaults to `1`. A zero weight is invalid and is also treated as `1`, as
    /// such objects should have been rejected by the CRD schema.
    pub fn weight(&self) -> u32 {
        match self.spec.weight {
            None | Some(0) => DEFAULT_QUEUE_WEIGHT,
            Some(weight) => weight,
        }
    }

    /// Validate the contents of this object.
    pub fn validate(&self) -> Result<(), AppError> {
        let mut errs: Vec<String> = vec![];
        if self.spec.weight == Some(0) {
            errs.push("queue weight must be greater than 0".into());
        }
        if self.metadata.namespace.as_deref().unwrap_or_default().is_empty() {
            errs.push("queues must be namespaced".into());
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(AppError::InvalidInput(errs.join("; ")))
        }
    }
}
