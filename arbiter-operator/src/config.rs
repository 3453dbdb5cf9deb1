//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for healthchecks & metrics.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The Kubernetes namespace in which the operator runs & holds its lease.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,

    /// The name of the allocation policy used to compute deserved shares.
    #[serde(default = "Config::default_policy")]
    pub policy: String,
    /// The maximum number of seconds between two arbitration cycles.
    #[serde(default = "Config::default_reconcile_interval_seconds")]
    pub reconcile_interval_seconds: u64,
    /// The number of milliseconds to wait after a cluster change before running a cycle, so that
    /// bursts of changes are folded into a single cycle.
    #[serde(default = "Config::default_reconcile_debounce_millis")]
    pub reconcile_debounce_millis: u64,

    /// The duration in seconds for which a lease is considered held.
    ///
    /// To ensure stable leadership, a 60 second lease is currently recommended.
    #[serde(default = "Config::default_lease_duration_seconds")]
    pub lease_duration_seconds: u32,
    /// The duration that a lease holder will retry refreshing lease.
    ///
    /// To ensure stable leadership, a 10 seconds renew rate is currently recommended.
    #[serde(default = "Config::default_lease_renew_seconds")]
    pub lease_renew_seconds: u32,

    /// Register the Queue CRD on startup.
    #[serde(default = "Config::default_register_crd")]
    pub register_crd: bool,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the relationships between config values.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.reconcile_interval_seconds >= 1, "RECONCILE_INTERVAL_SECONDS must be at least 1");
        ensure!(
            self.lease_duration_seconds > self.lease_renew_seconds,
            "LEASE_DURATION_SECONDS must be greater than LEASE_RENEW_SECONDS"
        );
        Ok(())
    }

    /// The maximum duration between two arbitration cycles.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds)
    }

    /// The delay applied after a cluster change before running a cycle.
    pub fn reconcile_debounce(&self) -> Duration {
        Duration::from_millis(self.reconcile_debounce_millis)
    }

    fn default_http_port() -> u16 {
        8080
    }

    fn default_policy() -> String {
        crate::policy::PROPORTION_POLICY_NAME.into()
    }

    fn default_reconcile_interval_seconds() -> u64 {
        5
    }

    fn default_reconcile_debounce_millis() -> u64 {
        500
    }

    fn default_lease_duration_seconds() -> u32 {
        60
    }

    fn default_lease_renew_seconds() -> u32 {
        10
    }

    fn default_register_crd() -> bool {
        true
    }

    /// Build a config instance for use in tests.
    #[cfg(test)]
    pub fn new_test() -> Self {
        Self {
            rust_log: "error".into(),
            http_port: Self::default_http_port(),
            namespace: "arbiter-system".into(),
            pod_name: "arbiter-operator-0".into(),
            policy: Self::default_policy(),
            reconcile_interval_seconds: Self::default_reconcile_interval_seconds(),
            reconcile_debounce_millis: 0,
            lease_duration_seconds: Self::default_lease_duration_seconds(),
            lease_renew_seconds: Self::default_lease_renew_seconds(),
            register_crd: false,
        }
    }
}
