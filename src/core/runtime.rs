//! Sidecar runtime orchestration.
//!
//! Start order: snap store → initializer (validate / restore) →
//! garbage collector → leader elector. The snapshotter is not started
//! directly: the elector's leadership callbacks start and stop it, so
//! exactly one sidecar in the cluster drives snapshotting.
//!
//! Shutdown order: elector → snapshotter (optionally taking a final
//! full snapshot) → garbage collector.

use crate::cluster::leader::{
    LeaderCallbacks, LeaderElector, MemberLeaseCallbacks, PromoteLearnerCallback,
};
use crate::core::config::Config;
use crate::init::initializer::{Initializer, InitializerConfig};
use crate::kv::KvClient;
use crate::ops::observability::MetricsRegistry;
use crate::snapshot::gc::GarbageCollector;
use crate::snapshot::snapshotter::{Snapshotter, SnapshotterHandle, SsrState};
use crate::snapstore::{get_snapstore, SnapStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Starting,
    Healthy,
    Failed,
    Stopped,
}

/// Health aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Snap store construction.
    pub snapstore: ComponentHealth,
    /// Data directory initialization.
    pub initializer: ComponentHealth,
    /// Leader elector loop.
    pub elector: ComponentHealth,
    /// Garbage collector loop.
    pub garbage_collector: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            snapstore: ComponentHealth::Starting,
            initializer: ComponentHealth::Starting,
            elector: ComponentHealth::Starting,
            garbage_collector: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the sidecar is ready.
    pub fn is_ready(&self) -> bool {
        matches!(
            (
                self.snapstore,
                self.initializer,
                self.elector,
                self.garbage_collector
            ),
            (
                ComponentHealth::Healthy,
                ComponentHealth::Healthy,
                ComponentHealth::Healthy,
                ComponentHealth::Healthy
            )
        )
    }
}

enum LeaderSignal {
    StartedLeading,
    StoppedLeading,
}

/// Trellis runtime holding all component handles.
pub struct Runtime {
    config: Arc<Config>,
    kv: Arc<dyn KvClient>,
    store: Option<Arc<dyn SnapStore>>,
    metrics: Arc<MetricsRegistry>,
    health: RuntimeHealth,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    snapshotter_handle: Option<SnapshotterHandle>,
    supervisor_handle: Option<JoinHandle<()>>,
    elector_handle: Option<JoinHandle<()>>,
    gc_handle: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Create a runtime over the given KV client.
    pub fn new(config: Config, kv: Arc<dyn KvClient>) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            kv,
            store: None,
            metrics: Arc::new(MetricsRegistry::new()),
            health: RuntimeHealth::default(),
            shutdown_tx,
            shutdown_rx,
            snapshotter_handle: None,
            supervisor_handle: None,
            elector_handle: None,
            gc_handle: None,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the metrics registry.
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Handle for external snapshot triggers, once started.
    pub fn snapshotter_handle(&self) -> Option<SnapshotterHandle> {
        self.snapshotter_handle.clone()
    }

    /// Initialize and start all runtime components.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            data_dir = %self.config.kv.data_dir.display(),
            provider = %self.config.snapstore.provider,
            "starting trellis runtime"
        );

        // 1. Snap store.
        let store = get_snapstore(&self.config.snapstore)
            .context("failed to create snap store from configured storage provider")?;
        self.store = Some(Arc::clone(&store));
        self.health.snapstore = ComponentHealth::Healthy;

        // 2. Validate / restore the data directory.
        let initializer = Initializer::new(
            InitializerConfig {
                data_dir: self.config.kv.data_dir.clone(),
                cluster_name: self.config.kv.cluster_name.clone(),
                member_id: self.config.kv.member_id.clone(),
                cluster_size: self.config.kv.cluster_size,
                fail_below_revision: self.config.kv.fail_below_revision,
                defrag_event_batch: self.config.restore.defrag_event_batch,
                restore_timeout_secs: self.config.restore.restore_timeout_secs,
                defrag_timeout_secs: self.config.kv.defrag_timeout_secs,
                embedded_quota_bytes: self.config.kv.embedded_quota_bytes,
                snapstore: Some(self.config.snapstore.clone()),
            },
            Arc::clone(&self.kv),
            Arc::clone(&self.metrics),
        );
        initializer.initialize().await.inspect_err(|_| {
            self.health.initializer = ComponentHealth::Failed;
        })?;
        self.health.initializer = ComponentHealth::Healthy;

        // 3. Snapshotter, supervised by the leadership callbacks.
        let mut snapshotter = Snapshotter::new(
            self.config.snapshotter_config(),
            Arc::clone(&store),
            self.config.snapstore.clone(),
            Arc::clone(&self.kv),
            self.config.compression,
            Arc::clone(&self.metrics),
        )
        .await
        .context("failed to build snapshotter")?;
        self.snapshotter_handle = Some(snapshotter.handle());

        let start_with_full = snapshotter
            .is_full_snapshot_required_at_startup(snapshotter.full_snapshot_max_time_window());
        tracing::info!(start_with_full, "decided startup snapshot mode");

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        self.supervisor_handle = Some(tokio::spawn(supervise_snapshotter(
            snapshotter,
            signal_rx,
            start_with_full,
        )));

        // 4. Garbage collector.
        let gc = GarbageCollector::new(
            Arc::clone(&store),
            self.config.snapshotter.garbage_collection_policy,
            self.config.gc_period(),
            self.config.snapshotter.max_backups,
            Arc::clone(&self.metrics),
        );
        let gc_stop = self.shutdown_rx.clone();
        self.gc_handle = Some(tokio::spawn(async move { gc.run(gc_stop).await }));
        self.health.garbage_collector = ComponentHealth::Healthy;

        // 5. Leader elector driving the snapshotter lifecycle.
        let start_tx = signal_tx.clone();
        let stop_tx = signal_tx.clone();
        let kv_for_promote = Arc::clone(&self.kv);
        let mut elector = LeaderElector::new(
            self.config.leader_election_config(),
            Arc::clone(&self.kv),
            LeaderCallbacks {
                on_started_leading: Box::new(move || {
                    let _ = start_tx.send(LeaderSignal::StartedLeading);
                }),
                on_stopped_leading: Box::new(move || {
                    let _ = stop_tx.send(LeaderSignal::StoppedLeading);
                }),
            },
            MemberLeaseCallbacks {
                start_lease_renewal: Box::new(|| {
                    tracing::info!("starting member lease renewal");
                }),
                stop_lease_renewal: Box::new(|| {
                    tracing::info!("stopping member lease renewal");
                }),
            },
            Some(PromoteLearnerCallback {
                promote: Box::new(move || {
                    let kv = Arc::clone(&kv_for_promote);
                    tokio::spawn(async move {
                        if let Err(err) = kv.promote_learner().await {
                            tracing::warn!(error = %err, "learner promotion failed");
                        }
                    });
                }),
            }),
        );
        let elector_stop = self.shutdown_rx.clone();
        self.elector_handle = Some(tokio::spawn(async move {
            if let Err(err) = elector.run(elector_stop).await {
                tracing::error!(error = %err, "leader elector failed");
            }
        }));
        self.health.elector = ComponentHealth::Healthy;

        tracing::info!("trellis runtime started");
        Ok(())
    }

    /// Wait for a shutdown signal, then stop all components.
    ///
    /// With `final_snapshot` set, an active snapshotter takes one
    /// terminating full snapshot before the runtime stops.
    pub async fn run_until_shutdown(&mut self, final_snapshot: bool) -> Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop(final_snapshot).await
    }

    /// Trigger graceful shutdown from another task.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop all runtime components.
    pub async fn stop(&mut self, final_snapshot: bool) -> Result<()> {
        tracing::info!("stopping trellis runtime");

        if final_snapshot {
            if let Some(handle) = &self.snapshotter_handle {
                if handle.state() == SsrState::Active {
                    match handle.trigger_full_snapshot(true).await {
                        Ok(Some(snap)) => {
                            tracing::info!(object = %snap.key(), "took final full snapshot");
                        }
                        Ok(None) => {
                            tracing::info!("final full snapshot skipped, nothing changed");
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "final full snapshot failed");
                        }
                    }
                }
            }
        }

        let _ = self.shutdown_tx.send(true);

        for handle in [
            self.elector_handle.take(),
            self.supervisor_handle.take(),
            self.gc_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
            let _ = handle.await;
        }

        self.health.elector = ComponentHealth::Stopped;
        self.health.garbage_collector = ComponentHealth::Stopped;
        tracing::info!("trellis runtime stopped");
        Ok(())
    }
}

/// Owns the snapshotter and runs it while this sidecar leads.
async fn supervise_snapshotter(
    snapshotter: Snapshotter,
    mut signals: mpsc::UnboundedReceiver<LeaderSignal>,
    mut start_with_full: bool,
) {
    let snapshotter = Arc::new(Mutex::new(snapshotter));
    let mut run_stop: Option<watch::Sender<bool>> = None;
    let mut run_task: Option<JoinHandle<()>> = None;

    while let Some(signal) = signals.recv().await {
        match signal {
            LeaderSignal::StartedLeading => {
                if run_stop.is_some() {
                    continue;
                }
                let (stop_tx, stop_rx) = watch::channel(false);
                let ssr = Arc::clone(&snapshotter);
                let with_full = start_with_full;
                // Takeover always begins with a full snapshot after
                // the first run.
                start_with_full = true;
                run_task = Some(tokio::spawn(async move {
                    let mut guard = ssr.lock().await;
                    if let Err(err) = guard.run(stop_rx, with_full).await {
                        tracing::error!(error = %err, "snapshotter exited with error");
                    }
                }));
                run_stop = Some(stop_tx);
            }
            LeaderSignal::StoppedLeading => {
                if let Some(stop_tx) = run_stop.take() {
                    let _ = stop_tx.send(true);
                }
                if let Some(task) = run_task.take() {
                    let _ = task.await;
                }
            }
        }
    }

    if let Some(stop_tx) = run_stop.take() {
        let _ = stop_tx.send(true);
    }
    if let Some(task) = run_task.take() {
        let _ = task.await;
    }
}
