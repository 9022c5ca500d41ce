//! Common test utilities.
//!
//! Shared helpers for the integration suites. Import with
//! `mod common;` in test files.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use trellis::config::SnapshotterConfig;
use trellis::error::TrellisResult;
use trellis::kv::embedded::EmbeddedKv;
use trellis::observability::MetricsRegistry;
use trellis::snapshotter::{Snapshotter, SnapshotterHandle, SsrState};
use trellis::snapstore::fake::FakeSnapStore;
use trellis::snapstore::{SnapstoreConfig, SnapstoreProvider};
use trellis::types::{Snapshot, SnapshotKind};

/// A cron expression that will not fire during a test run.
pub const FAR_FUTURE_SCHEDULE: &str = "0 0 1 1 *";

/// Snapshotter settings tuned for fast tests.
pub fn test_snapshotter_config(schedule: &str, delta_period: Duration) -> SnapshotterConfig {
    SnapshotterConfig {
        full_snapshot_schedule: schedule.to_string(),
        delta_snapshot_period: delta_period,
        delta_snapshot_memory_limit: 10 * 1024 * 1024,
        connection_timeout: Duration::from_secs(5),
        snapshot_timeout: Duration::from_secs(30),
    }
}

/// Store settings matching an in-memory fake store.
pub fn fake_store_config() -> SnapstoreConfig {
    SnapstoreConfig {
        provider: SnapstoreProvider::Fake,
        container: String::new(),
        prefix: String::new(),
        temp_dir: std::path::PathBuf::from("/tmp"),
        credentials_file: None,
        endpoint: None,
        object_lock_retention_secs: None,
    }
}

/// A snapshotter running in a background task.
pub struct SsrHarness {
    pub handle: SnapshotterHandle,
    pub stop: watch::Sender<bool>,
    pub task: JoinHandle<TrellisResult<()>>,
}

impl SsrHarness {
    /// Signal the stop channel and wait for the run loop to exit.
    pub async fn shutdown(self) -> TrellisResult<()> {
        let _ = self.stop.send(true);
        self.task.await.expect("snapshotter task panicked")
    }
}

/// Spawn a snapshotter over the given store and KV.
pub async fn spawn_snapshotter(
    config: SnapshotterConfig,
    store: Arc<FakeSnapStore>,
    kv: Arc<EmbeddedKv>,
    start_with_full_snapshot: bool,
) -> SsrHarness {
    let mut snapshotter = Snapshotter::new(
        config,
        store,
        fake_store_config(),
        kv,
        Default::default(),
        Arc::new(MetricsRegistry::new()),
    )
    .await
    .expect("failed to build snapshotter");

    let handle = snapshotter.handle();
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move { snapshotter.run(stop_rx, start_with_full_snapshot).await });

    wait_until(|| handle.state() == SsrState::Active, Duration::from_secs(5)).await;
    SsrHarness {
        handle,
        stop: stop_tx,
        task,
    }
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll the store until it holds `count` snapshots of `kind`.
pub async fn wait_for_snapshots(
    store: &FakeSnapStore,
    kind: SnapshotKind,
    count: usize,
    timeout: Duration,
) -> Vec<Snapshot> {
    use trellis::snapstore::SnapStore;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snaps: Vec<Snapshot> = store
            .list()
            .await
            .expect("list failed")
            .into_iter()
            .filter(|s| s.kind == kind)
            .collect();
        if snaps.len() >= count {
            return snaps;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {count} {kind} snapshots, found {} within {timeout:?}",
            snaps.len()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Insert `count` keys, returning the final revision.
pub fn populate_kv(kv: &EmbeddedKv, count: usize) -> u64 {
    let mut revision = 0;
    for i in 0..count {
        let key = format!("key-{i:05}").into_bytes();
        let value = format!("value-{i}").into_bytes();
        revision = kv.put(&key, &value);
    }
    revision
}
