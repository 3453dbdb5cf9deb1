use anyhow::Result;

use crate::config::Config;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("HTTP_PORT".into(), "9090".into()),
        ("NAMESPACE".into(), "arbiter-system".into()),
        ("POD_NAME".into(), "arbiter-operator-0".into()),
        ("POLICY".into(), "proportion".into()),
        ("RECONCILE_INTERVAL_SECONDS".into(), "30".into()),
        ("RECONCILE_DEBOUNCE_MILLIS".into(), "250".into()),
        ("LEASE_DURATION_SECONDS".into(), "15".into()),
        ("LEASE_RENEW_SECONDS".into(), "5".into()),
        ("REGISTER_CRD".into(), "false".into()),
    ])?;
    config.validate()?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.http_port == 9090, "unexpected value parsed for HTTP_PORT, got {}, expected {}", config.http_port, 9090);
    assert!(config.namespace == "arbiter-system", "unexpected value parsed for NAMESPACE, got {}, expected {}", config.namespace, "arbiter-system");
    assert!(
        config.pod_name == "arbiter-operator-0",
        "unexpected value parsed for POD_NAME, got {}, expected {}",
        config.pod_name,
        "arbiter-operator-0"
    );
    assert!(config.policy == "proportion", "unexpected value parsed for POLICY, got {}, expected {}", config.policy, "proportion");
    assert!(
        config.reconcile_interval_seconds == 30,
        "unexpected value parsed for RECONCILE_INTERVAL_SECONDS, got {}, expected {}",
        config.reconcile_interval_seconds,
        30
    );
    assert!(
        config.reconcile_debounce_millis == 250,
        "unexpected value parsed for RECONCILE_DEBOUNCE_MILLIS, got {}, expected {}",
        config.reconcile_debounce_millis,
        250
    );
    assert!(
        config.lease_duration_seconds == 15,
        "unexpected value parsed for LEASE_DURATION_SECONDS, got {}, expected {}",
        config.lease_duration_seconds,
        15
    );
    assert!(
        config.lease_renew_seconds == 5,
        "unexpected value parsed for LEASE_RENEW_SECONDS, got {}, expected {}",
        config.lease_renew_seconds,
        5
    );
    assert!(!config.register_crd, "unexpected value parsed for REGISTER_CRD, got {}, expected {}", config.register_crd, false);

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("NAMESPACE".into(), "arbiter-system".into()),
        ("POD_NAME".into(), "arbiter-operator-0".into()),
    ])?;
    config.validate()?;

    assert!(config.http_port == 8080, "unexpected default for HTTP_PORT, got {}, expected {}", config.http_port, 8080);
    assert!(config.policy == "proportion", "unexpected default for POLICY, got {}, expected {}", config.policy, "proportion");
    assert!(
        config.reconcile_interval_seconds == 5,
        "unexpected default for RECONCILE_INTERVAL_SECONDS, got {}, expected {}",
        config.reconcile_interval_seconds,
        5
    );
    assert!(
        config.reconcile_debounce_millis == 500,
        "unexpected default for RECONCILE_DEBOUNCE_MILLIS, got {}, expected {}",
        config.reconcile_debounce_millis,
        500
    );
    assert!(
        config.lease_duration_seconds == 60,
        "unexpected default for LEASE_DURATION_SECONDS, got {}, expected {}",
        config.lease_duration_seconds,
        60
    );
    assert!(
        config.lease_renew_seconds == 10,
        "unexpected default for LEASE_RENEW_SECONDS, got {}, expected {}",
        config.lease_renew_seconds,
        10
    );
    assert!(config.register_crd, "unexpected default for REGISTER_CRD, got {}, expected {}", config.register_crd, true);

    Ok(())
}

#[test]
fn config_rejects_renew_longer_than_lease() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("NAMESPACE".into(), "arbiter-system".into()),
        ("POD_NAME".into(), "arbiter-operator-0".into()),
        ("LEASE_DURATION_SECONDS".into(), "10".into()),
        ("LEASE_RENEW_SECONDS".into(), "10".into()),
    ])?;

    assert!(config.validate().is_err(), "expected validation to fail when the renew period is not shorter than the lease");

    Ok(())
}
