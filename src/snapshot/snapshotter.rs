//! Full/delta snapshot scheduler and event collector.
//!
//! The snapshotter owns all of its mutable state and interacts with
//! the outside world by message passing: two request channels carry
//! external triggers, each bundled with a one-shot acknowledgement.
//! The event loop multiplexes the trigger channels, the two snapshot
//! timers, the KV watch stream and the stop signal, so at most one
//! snapshot operation is ever in flight.
//!
//! Full snapshots fire on a cron schedule; delta snapshots fire on a
//! fixed period (disabled below one second) and are forced early when
//! the in-memory event buffer crosses the configured memory limit.

use crate::compress::{compress_stream, CompressionConfig};
use crate::core::config::SnapshotterConfig;
use crate::core::error::{TrellisError, TrellisResult};
use crate::core::schedule::Schedule;
use crate::kv::{KvClient, TimedEvent, WatchResponse, WatchStream};
use crate::ops::observability::MetricsRegistry;
use crate::snapshot::types::{Snapshot, SnapshotKind};
use crate::snapstore::{
    get_snapstore, latest_full_and_deltas, snapstore_secret_modified_time, SnapStore,
    SnapstoreConfig,
};
use chrono::{DateTime, DurationRound, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Delta periods below this threshold disable delta snapshotting.
pub const DELTA_SNAPSHOT_INTERVAL_THRESHOLD: Duration = Duration::from_secs(1);

/// Built-in delta interval the timer is first armed with.
pub const DEFAULT_DELTA_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(20);

/// A deadline far enough away to stand in for "never".
fn never() -> Instant {
    Instant::now() + Duration::from_secs(365 * 24 * 3600)
}

/// Snapshotter activity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsrState {
    Active,
    Inactive,
}

/// Result delivered on the trigger acknowledgement channels.
///
/// `None` means the operation was legitimately skipped (empty event
/// buffer, or an unchanged final snapshot).
pub type SnapResult = TrellisResult<Option<Snapshot>>;

type FullRequest = (bool, oneshot::Sender<SnapResult>);
type DeltaRequest = oneshot::Sender<SnapResult>;

enum LoopEvent {
    FullRequest(bool, oneshot::Sender<SnapResult>),
    DeltaRequest(oneshot::Sender<SnapResult>),
    FullTimer,
    DeltaTimer,
    Watch(Option<TrellisResult<WatchResponse>>),
    Stop,
}

/// Cloneable handle for external triggers and state inspection.
#[derive(Clone)]
pub struct SnapshotterHandle {
    state: Arc<Mutex<SsrState>>,
    full_tx: mpsc::Sender<FullRequest>,
    delta_tx: mpsc::Sender<DeltaRequest>,
    delta_period: Duration,
}

impl SnapshotterHandle {
    /// Current activity state.
    pub fn state(&self) -> SsrState {
        *self.state.lock()
    }

    /// Request a full snapshot outside the regular schedule.
    pub async fn trigger_full_snapshot(&self, is_final: bool) -> SnapResult {
        if *self.state.lock() != SsrState::Active {
            return Err(TrellisError::SnapshotterInactive);
        }
        tracing::info!("triggering out of schedule full snapshot");
        let (ack_tx, ack_rx) = oneshot::channel();
        self.full_tx
            .send((is_final, ack_tx))
            .await
            .map_err(|_| TrellisError::SnapshotterInactive)?;
        ack_rx.await.map_err(|_| TrellisError::SnapshotterInactive)?
    }

    /// Request a delta snapshot outside the regular schedule.
    pub async fn trigger_delta_snapshot(&self) -> SnapResult {
        if *self.state.lock() != SsrState::Active {
            return Err(TrellisError::SnapshotterInactive);
        }
        if self.delta_period < DELTA_SNAPSHOT_INTERVAL_THRESHOLD {
            return Err(TrellisError::DeltaSnapshottingDisabled {
                period_secs: self.delta_period.as_secs(),
            });
        }
        tracing::info!("triggering out of schedule delta snapshot");
        let (ack_tx, ack_rx) = oneshot::channel();
        self.delta_tx
            .send(ack_tx)
            .await
            .map_err(|_| TrellisError::SnapshotterInactive)?;
        ack_rx.await.map_err(|_| TrellisError::SnapshotterInactive)?
    }
}

/// Full/delta snapshot coordinator.
pub struct Snapshotter {
    config: SnapshotterConfig,
    schedule: Schedule,
    store: Arc<dyn SnapStore>,
    store_config: SnapstoreConfig,
    kv: Arc<dyn KvClient>,
    compression: CompressionConfig,
    metrics: Arc<MetricsRegistry>,

    state: Arc<Mutex<SsrState>>,

    /// Most recent snapshot of either kind.
    pub prev_snapshot: Snapshot,
    /// Most recent full snapshot, if any exists in the store.
    pub prev_full_snapshot: Option<Snapshot>,
    /// Deltas of the current chain.
    pub prev_delta_snapshots: Vec<Snapshot>,
    /// Whether the previous full snapshot attempt succeeded.
    pub prev_full_snapshot_succeeded: bool,

    events: Vec<u8>,
    last_event_revision: u64,
    last_secret_modified_time: DateTime<Utc>,

    watch: Option<WatchStream>,

    full_req_rx: mpsc::Receiver<FullRequest>,
    delta_req_rx: mpsc::Receiver<DeltaRequest>,
    full_tx: mpsc::Sender<FullRequest>,
    delta_tx: mpsc::Sender<DeltaRequest>,

    full_deadline: Instant,
    delta_deadline: Instant,
}

impl Snapshotter {
    /// Build a snapshotter, discovering the previous chain from the
    /// store so that delta numbering resumes where it left off.
    pub async fn new(
        config: SnapshotterConfig,
        store: Arc<dyn SnapStore>,
        store_config: SnapstoreConfig,
        kv: Arc<dyn KvClient>,
        compression: CompressionConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> TrellisResult<Self> {
        let schedule = Schedule::parse(&config.full_snapshot_schedule)?;

        let (full_snap, delta_snaps) = latest_full_and_deltas(store.as_ref()).await?;
        let prev_snapshot = match (&full_snap, delta_snaps.last()) {
            (_, Some(last_delta)) => last_delta.clone(),
            (Some(full), None) => full.clone(),
            // Dummy previous snapshot; nothing has been backed up yet.
            (None, None) => Snapshot::new(SnapshotKind::Full, 0, 0, "", false),
        };
        if let Some(full) = &full_snap {
            metrics.full.latest_timestamp.set(full.created_on.timestamp());
            metrics
                .full
                .latest_revision
                .set(full.last_revision as i64);
        }
        metrics
            .delta
            .latest_timestamp
            .set(prev_snapshot.created_on.timestamp());

        let (full_tx, full_req_rx) = mpsc::channel(1);
        let (delta_tx, delta_req_rx) = mpsc::channel(1);

        Ok(Self {
            config,
            schedule,
            store,
            store_config,
            kv,
            compression,
            metrics,
            state: Arc::new(Mutex::new(SsrState::Inactive)),
            prev_snapshot,
            prev_full_snapshot: full_snap,
            prev_delta_snapshots: delta_snaps,
            prev_full_snapshot_succeeded: true,
            events: Vec::new(),
            last_event_revision: 0,
            last_secret_modified_time: DateTime::<Utc>::UNIX_EPOCH,
            watch: None,
            full_req_rx,
            delta_req_rx,
            full_tx,
            delta_tx,
            full_deadline: never(),
            delta_deadline: never(),
        })
    }

    /// Handle for external triggers; valid across restarts of
    /// [`Self::run`].
    pub fn handle(&self) -> SnapshotterHandle {
        SnapshotterHandle {
            state: Arc::clone(&self.state),
            full_tx: self.full_tx.clone(),
            delta_tx: self.delta_tx.clone(),
            delta_period: self.config.delta_snapshot_period,
        }
    }

    fn delta_enabled(&self) -> bool {
        self.config.delta_snapshot_period >= DELTA_SNAPSHOT_INTERVAL_THRESHOLD
    }

    /// Run the snapshot event loop until stopped or a fatal error.
    ///
    /// With `start_with_full_snapshot` unset, the snapshotter first
    /// catches up on events accumulated since the previous snapshot
    /// and only then arms the cron timer.
    pub async fn run(
        &mut self,
        mut stop: watch::Receiver<bool>,
        start_with_full_snapshot: bool,
    ) -> TrellisResult<()> {
        *self.state.lock() = SsrState::Active;
        let result = self.run_inner(&mut stop, start_with_full_snapshot).await;
        self.shutdown();
        result
    }

    async fn run_inner(
        &mut self,
        stop: &mut watch::Receiver<bool>,
        start_with_full_snapshot: bool,
    ) -> TrellisResult<()> {
        if start_with_full_snapshot {
            self.full_deadline = Instant::now();
        } else {
            if self.watch.is_none() {
                let stopped = self.collect_events_since_prev_snapshot(stop).await?;
                if stopped {
                    return Ok(());
                }
            }
            self.reset_full_snapshot_timer()?;
        }

        // The delta timer is first armed with the built-in interval,
        // then immediately re-armed with the configured period when
        // that period is at or above the threshold.
        self.delta_deadline = Instant::now() + DEFAULT_DELTA_SNAPSHOT_INTERVAL;
        if self.delta_enabled() {
            self.delta_deadline = Instant::now() + self.config.delta_snapshot_period;
        } else {
            self.delta_deadline = never();
        }

        tracing::info!("starting the snapshot event handler");
        loop {
            if *stop.borrow() {
                tracing::info!("closing the snapshot event handler");
                self.cleanup_in_memory_events();
                return Ok(());
            }

            let event = {
                let full_req_rx = &mut self.full_req_rx;
                let delta_req_rx = &mut self.delta_req_rx;
                let watch_stream = &mut self.watch;
                let full_deadline = self.full_deadline;
                let delta_deadline = self.delta_deadline;
                tokio::select! {
                    Some((is_final, ack)) = full_req_rx.recv() => LoopEvent::FullRequest(is_final, ack),
                    Some(ack) = delta_req_rx.recv() => LoopEvent::DeltaRequest(ack),
                    _ = tokio::time::sleep_until(full_deadline) => LoopEvent::FullTimer,
                    _ = tokio::time::sleep_until(delta_deadline) => LoopEvent::DeltaTimer,
                    response = watch_recv(watch_stream) => LoopEvent::Watch(response),
                    _ = stop.changed() => LoopEvent::Stop,
                }
            };

            match event {
                LoopEvent::FullRequest(is_final, ack) => {
                    let result = self.take_full_snapshot_and_reset_timer(is_final).await;
                    self.prev_full_snapshot_succeeded = result.is_ok();
                    let failed = result_is_fatal(&result);
                    let _ = ack.send(result);
                    if let Some(err) = failed {
                        return Err(err);
                    }
                }
                LoopEvent::DeltaRequest(ack) => {
                    let result = self.take_delta_snapshot_and_reset_timer().await;
                    let failed = result_is_fatal(&result);
                    let _ = ack.send(result);
                    if let Some(err) = failed {
                        return Err(err);
                    }
                }
                LoopEvent::FullTimer => {
                    let result = self.take_full_snapshot_and_reset_timer(false).await;
                    self.prev_full_snapshot_succeeded = result.is_ok();
                    self.handle_loop_result(result, SnapshotKind::Full)?;
                }
                LoopEvent::DeltaTimer => {
                    if self.delta_enabled() {
                        let result = self.take_delta_snapshot_and_reset_timer().await;
                        self.handle_loop_result(result, SnapshotKind::Delta)?;
                    }
                }
                LoopEvent::Watch(Some(Ok(response))) => {
                    self.handle_delta_watch_events(response).await?;
                }
                LoopEvent::Watch(Some(Err(err))) => {
                    return Err(err);
                }
                LoopEvent::Watch(None) => {
                    return Err(TrellisError::internal("watch channel closed"));
                }
                LoopEvent::Stop => {
                    tracing::info!("closing the snapshot event handler");
                    self.cleanup_in_memory_events();
                    return Ok(());
                }
            }
        }
    }

    /// Transient failures keep the loop alive for its next tick;
    /// anything else exits so the caller can restart the process.
    fn handle_loop_result(&self, result: SnapResult, kind: SnapshotKind) -> TrellisResult<()> {
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.is_transient() => {
                tracing::warn!(kind = %kind, error = %err, "snapshot attempt failed; retrying on next tick");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("closing the snapshotter");
        *self.state.lock() = SsrState::Inactive;
        self.cleanup_in_memory_events();
        self.watch = None;
        self.full_deadline = never();
        self.delta_deadline = never();
    }

    fn cleanup_in_memory_events(&mut self) {
        self.events.clear();
        self.last_event_revision = 0;
    }

    /// Rebuild the snap store handle if the backing credentials were
    /// modified since last observed.
    fn refresh_snapstore_if_rotated(&mut self) -> TrellisResult<()> {
        tracing::debug!("checking the timestamp of the snap store secret");
        let modified = snapstore_secret_modified_time(&self.store_config)?;
        if modified <= self.last_secret_modified_time {
            return Ok(());
        }
        self.last_secret_modified_time = modified;
        self.store = get_snapstore(&self.store_config)?;
        tracing::info!("updated the snap store handle with rotated credentials");
        Ok(())
    }

    async fn latest_kv_revision(&self) -> TrellisResult<u64> {
        tokio::time::timeout(self.config.connection_timeout, self.kv.latest_revision())
            .await
            .map_err(|_| TrellisError::kv("timed out reading latest revision"))?
    }

    /// Take a full snapshot and re-arm the cron timer.
    pub async fn take_full_snapshot_and_reset_timer(&mut self, is_final: bool) -> SnapResult {
        tracing::info!(time = %Utc::now(), "taking scheduled full snapshot");
        match self.take_full_snapshot(is_final).await {
            Ok(snap) => {
                self.reset_full_snapshot_timer()?;
                Ok(snap)
            }
            Err(err) => {
                tracing::warn!(error = %err, "taking scheduled full snapshot failed");
                self.metrics.full.failed.inc();
                Err(err)
            }
        }
    }

    async fn take_full_snapshot(&mut self, is_final: bool) -> SnapResult {
        let result = self.take_full_snapshot_inner(is_final).await;
        self.cleanup_in_memory_events();
        result
    }

    async fn take_full_snapshot_inner(&mut self, is_final: bool) -> SnapResult {
        // Drop any previous watch before re-snapshotting.
        self.watch = None;

        self.refresh_snapstore_if_rotated()?;

        let last_revision = self.latest_kv_revision().await?;

        if is_final
            && self.prev_snapshot.is_final
            && self.prev_snapshot.kind == SnapshotKind::Full
            && self.prev_snapshot.last_revision == last_revision
        {
            tracing::info!(
                "no new updates since previous final full snapshot, skipping new final full snapshot"
            );
        } else {
            let suffix = self.compression.suffix();
            let snap = Snapshot::new(SnapshotKind::Full, 0, last_revision, suffix, is_final);

            // The revision read and the stream are not atomic; the
            // stream may run slightly ahead of `last_revision`.
            let mut reader = self.kv.snapshot_stream().await?;
            if self.compression.enabled {
                reader = compress_stream(reader, self.compression.policy)?;
            }
            tokio::time::timeout(
                self.config.snapshot_timeout,
                self.store.save(&snap, reader),
            )
            .await
            .map_err(|_| TrellisError::transient("full snapshot upload timed out"))??;

            self.prev_snapshot = snap.clone();
            self.prev_full_snapshot = Some(snap.clone());
            self.prev_delta_snapshots.clear();

            self.metrics.record_snapshot(
                SnapshotKind::Full,
                snap.last_revision,
                snap.created_on.timestamp(),
            );
            self.metrics.chain_deltas.set(0);
            self.metrics.chain_delta_revisions.set(0);

            tracing::info!(object = %snap.key(), "successfully saved full snapshot");
        }

        // Cleared for both the skip case and the success case.
        self.metrics.full.required.set(0);
        self.metrics.delta.required.set(0);

        if !self.delta_enabled() {
            return Ok(Some(self.prev_snapshot.clone()));
        }

        let from_revision = self.prev_snapshot.last_revision + 1;
        self.watch = Some(self.kv.watch(from_revision).await?);
        tracing::info!(revision = from_revision, "applied watch on kv store");

        Ok(Some(self.prev_snapshot.clone()))
    }

    async fn take_delta_snapshot_and_reset_timer(&mut self) -> SnapResult {
        match self.take_delta_snapshot().await {
            Ok(snap) => {
                tracing::debug!(
                    period = ?self.config.delta_snapshot_period,
                    "re-arming delta snapshot timer"
                );
                self.delta_deadline = Instant::now() + self.config.delta_snapshot_period;
                Ok(snap)
            }
            Err(err) => {
                tracing::warn!(error = %err, "taking delta snapshot failed");
                self.metrics.delta.failed.inc();
                Err(err)
            }
        }
    }

    /// Take a delta snapshot of the events collected up to now.
    pub async fn take_delta_snapshot(&mut self) -> SnapResult {
        let result = self.take_delta_snapshot_inner().await;
        self.cleanup_in_memory_events();
        result
    }

    async fn take_delta_snapshot_inner(&mut self) -> SnapResult {
        tracing::info!(time = %Utc::now(), "taking delta snapshot");

        if self.events.is_empty() {
            tracing::info!("no events received to save snapshot, skipping delta snapshot");
            self.metrics.delta.required.set(0);
            return Ok(None);
        }
        self.events.push(b']');

        self.refresh_snapstore_if_rotated()?;

        let suffix = self.compression.suffix();
        let snap = Snapshot::new(
            SnapshotKind::Delta,
            self.prev_snapshot.last_revision + 1,
            self.last_event_revision,
            suffix,
            false,
        );

        let mut payload = std::mem::take(&mut self.events);
        let digest = Sha256::digest(&payload);
        payload.extend_from_slice(&digest);

        let mut reader: Box<dyn std::io::Read + Send> = Box::new(Cursor::new(payload));
        if self.compression.enabled {
            tracing::info!("compressing delta snapshot");
            reader = compress_stream(reader, self.compression.policy)?;
        }

        let started = std::time::Instant::now();
        tokio::time::timeout(
            self.config.snapshot_timeout,
            self.store.save(&snap, reader),
        )
        .await
        .map_err(|_| TrellisError::transient("delta snapshot upload timed out"))??;
        tracing::info!(
            elapsed = ?started.elapsed(),
            object = %snap.key(),
            "successfully saved delta snapshot"
        );

        self.prev_snapshot = snap.clone();
        self.prev_delta_snapshots.push(snap.clone());

        self.metrics.record_snapshot(
            SnapshotKind::Delta,
            snap.last_revision,
            snap.created_on.timestamp(),
        );
        self.metrics
            .chain_deltas
            .set(self.prev_delta_snapshots.len() as i64);
        self.metrics
            .chain_delta_revisions
            .set((snap.last_revision - snap.start_revision) as i64);

        Ok(Some(snap))
    }

    /// Aggregate watch events into the buffer, forcing an early delta
    /// when the buffer crosses the memory limit.
    async fn handle_delta_watch_events(&mut self, response: WatchResponse) -> TrellisResult<()> {
        for event in response.events {
            self.last_event_revision = event.kv.mod_revision;
            let timed = TimedEvent::new(event);
            let json = serde_json::to_vec(&timed)
                .map_err(|e| TrellisError::internal(format!("marshal event to json: {e}")))?;
            if self.events.is_empty() {
                self.events.push(b'[');
            } else {
                self.events.push(b',');
            }
            self.events.extend_from_slice(&json);
            self.metrics.full.required.set(1);
            self.metrics.delta.required.set(1);
        }
        tracing::debug!(revision = self.last_event_revision, "added events");

        if self.events.len() >= self.config.delta_snapshot_memory_limit {
            tracing::info!(
                bytes = self.events.len(),
                "delta events crossed the memory limit"
            );
            let result = self.take_delta_snapshot_and_reset_timer().await;
            return self.handle_loop_result(result, SnapshotKind::Delta);
        }
        Ok(())
    }

    /// Collect the first delta snapshot(s) on startup, draining the
    /// watch until it has caught up with the KV's latest revision.
    ///
    /// Returns true if the stop signal interrupted the catch-up.
    pub async fn collect_events_since_prev_snapshot(
        &mut self,
        stop: &mut watch::Receiver<bool>,
    ) -> TrellisResult<bool> {
        self.watch = None;

        let latest_kv_revision = self.latest_kv_revision().await?;

        self.metrics.full.required.set(0);
        self.metrics.delta.required.set(0);
        if self
            .prev_full_snapshot
            .as_ref()
            .map(|s| s.last_revision != latest_kv_revision)
            .unwrap_or(true)
        {
            self.metrics.full.required.set(1);
        }

        let from_revision = self.prev_snapshot.last_revision + 1;
        self.watch = Some(self.kv.watch(from_revision).await?);
        tracing::info!(revision = from_revision, "applied watch on kv store");

        if self.prev_snapshot.last_revision == latest_kv_revision {
            tracing::info!("no new events since last snapshot, skipping initial delta snapshot");
            return Ok(false);
        }

        // The KV is ahead of the last snapshot: a catch-up delta is
        // needed now and a full snapshot will be required later.
        self.metrics.full.required.set(1);
        self.metrics.delta.required.set(1);

        loop {
            let received = {
                let watch_stream = &mut self.watch;
                tokio::select! {
                    response = watch_recv(watch_stream) => Some(response),
                    _ = stop.changed() => None,
                }
            };
            match received {
                None => {
                    self.cleanup_in_memory_events();
                    return Ok(true);
                }
                Some(Some(Ok(response))) => {
                    let last_watch_revision = response.last_revision();
                    self.handle_delta_watch_events(response).await?;
                    if last_watch_revision >= latest_kv_revision {
                        return Ok(false);
                    }
                }
                Some(Some(Err(err))) => return Err(err),
                Some(None) => return Err(TrellisError::internal("watch channel closed")),
            }
        }
    }

    fn reset_full_snapshot_timer(&mut self) -> TrellisResult<()> {
        let now = Utc::now();
        let Some(effective) = self.schedule.next(now) else {
            tracing::info!("there are no snapshots scheduled for the future, stopping now");
            return Err(TrellisError::configuration(
                "full snapshot schedule has no future fire time",
            ));
        };
        let duration = (effective - now)
            .to_std()
            .unwrap_or(Duration::from_secs(0));
        self.full_deadline = Instant::now() + duration;
        tracing::info!(at = %effective, "will take next full snapshot");
        Ok(())
    }

    /// Whether an immediate full snapshot is required at startup.
    pub fn is_full_snapshot_required_at_startup(&self, time_window_hours: f64) -> bool {
        let Some(prev_full) = &self.prev_full_snapshot else {
            return true;
        };
        let age_hours = (Utc::now() - prev_full.created_on).num_seconds() as f64 / 3600.0;
        if prev_full.is_final || age_hours > time_window_hours || !self.prev_full_snapshot_succeeded
        {
            return true;
        }

        if !self.was_scheduled_full_snapshot_missed(time_window_hours) {
            return false;
        }
        self.is_next_full_snapshot_beyond_time_window(time_window_hours)
    }

    /// Whether the preceding scheduled full snapshot slot was missed.
    pub fn was_scheduled_full_snapshot_missed(&self, time_window_hours: f64) -> bool {
        let Some(prev_full) = &self.prev_full_snapshot else {
            return true;
        };
        let now = Utc::now();
        let Some(next) = self.schedule.next(now) else {
            return true;
        };
        let prev_scheduled = Schedule::prev_scheduled_time(next, time_window_hours);
        let created = prev_full
            .created_on
            .duration_trunc(chrono::Duration::seconds(1))
            .unwrap_or(prev_full.created_on);
        if prev_scheduled == created {
            tracing::info!(
                "previous full snapshot was taken at scheduled time, skipping the full snapshot at startup"
            );
            return false;
        }
        true
    }

    /// Whether waiting for the next scheduled full snapshot would
    /// push the elapsed window past its maximum.
    pub fn is_next_full_snapshot_beyond_time_window(&self, time_window_hours: f64) -> bool {
        let Some(prev_full) = &self.prev_full_snapshot else {
            return true;
        };
        let now = Utc::now();
        let Some(next) = self.schedule.next(now) else {
            return true;
        };
        let hours_until_next = (next - now).num_seconds() as f64 / 3600.0;
        let hours_since_prev = (now - prev_full.created_on).num_seconds() as f64 / 3600.0;
        hours_until_next + hours_since_prev > time_window_hours
    }

    /// Maximum time window in hours derived from the cron expression.
    pub fn full_snapshot_max_time_window(&self) -> f64 {
        self.schedule.max_time_window()
    }
}

async fn watch_recv(watch: &mut Option<WatchStream>) -> Option<TrellisResult<WatchResponse>> {
    match watch {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

/// Fatal loop errors after an acknowledged trigger: anything that is
/// not transient exits the loop once the ack has been delivered.
fn result_is_fatal(result: &SnapResult) -> Option<TrellisError> {
    match result {
        Err(err) if !err.is_transient() => Some(clone_error(err)),
        _ => None,
    }
}

fn clone_error(err: &TrellisError) -> TrellisError {
    TrellisError::internal(err.to_string())
}
