use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::cache::{self, ClusterCache};
use crate::config::Config;
use crate::controller::Controller;
use crate::k8s::coordination::{LeaderElectionConfig, LeaderElector};
use crate::k8s::{self, KubeControlPlane};
use crate::policy;
use crate::server::spawn_http_server;

/// The application object for when the operator is running.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the cluster state cache.
    cache: JoinHandle<Result<()>>,
    /// The join handle of the leader elector.
    elector: JoinHandle<()>,
    /// The join handle of the arbitration controller.
    controller: JoinHandle<Result<()>>,
    /// The join handle of the HTTP server.
    server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    ///
    /// Any failure here is fatal: the operator never arbitrates without a complete initial view
    /// of the cluster.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        let policy = policy::new(&config.policy).context("invalid POLICY")?;
        let election_config = LeaderElectionConfig::new(&config).context("invalid lease coordination config")?;

        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;
        if config.register_crd {
            k8s::ensure_queue_crd(client.clone()).await?;
        }

        // Establish the initial cluster state before anything else starts.
        cache::register_metrics();
        let (mut cluster_cache, cache_handle) = ClusterCache::new(client.clone(), shutdown_tx.subscribe());
        cluster_cache.bootstrap().await.context("error bootstrapping cluster state cache")?;

        // Spawn various core tasks.
        let cache = cluster_cache.spawn();
        let (elector, leader_rx) = LeaderElector::new(client.clone(), election_config, shutdown_tx.subscribe());
        let elector = elector.spawn();
        let control_plane = Arc::new(KubeControlPlane::new(client, leader_rx.clone()));
        let controller = Controller::new(config.clone(), cache_handle, policy, control_plane, leader_rx, shutdown_tx.subscribe()).spawn();
        let server = spawn_http_server(&config, metrics, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            cache,
            elector,
            controller,
            server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Arbiter Operator is shutting down");
        if let Err(err) = self.controller.await.context("error joining arbitration controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down arbitration controller");
        }
        if let Err(err) = self.elector.await {
            tracing::error!(error = ?err, "error joining leader elector task");
        }
        if let Err(err) = self.cache.await.context("error joining cluster state cache handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down cluster state cache");
        }
        if let Err(err) = self.server.await.context("error joining http server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down http server");
        }

        tracing::debug!("Arbiter Operator shutdown complete");
        Ok(())
    }
}
