//! Allocation policies.
//!
//! A policy divides the cluster capacity among the live queues. Policies are stateless and must
//! be deterministic: the same weights & capacity always produce the same shares.

mod proportion;

use std::collections::BTreeMap;
use std::sync::Arc;

use arbiter_core::{AppError, ResourceVector};
pub use proportion::ProportionPolicy;

/// The name of the weighted proportional share policy.
pub const PROPORTION_POLICY_NAME: &str = "proportion";

/// A strategy for dividing cluster capacity among queues.
pub trait AllocationPolicy: Send + Sync {
    /// The name under which this policy is registered.
    fn name(&self) -> &'static str;

    /// Compute the deserved share of each queue.
    ///
    /// `weights` maps each queue's key to its effective weight. The returned map has exactly the
    /// same keys, and the sum of all shares never exceeds `capacity` on any dimension.
    fn compute(&self, weights: &BTreeMap<String, u32>, capacity: &ResourceVector) -> BTreeMap<String, ResourceVector>;
}

/// Resolve an allocation policy by name.
pub fn new(name: &str) -> Result<Arc<dyn AllocationPolicy>, AppError> {
    match name {
        PROPORTION_POLICY_NAME => Ok(Arc::new(ProportionPolicy)),
        _ => Err(AppError::UnknownPolicy(name.into())),
    }
}
