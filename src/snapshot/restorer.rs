//! Snapshot-chain replayer.
//!
//! Materialises a fresh data directory from a base full snapshot plus
//! its contiguous delta snapshots. All work happens in a `.part`
//! sibling of the target directory; the target is only touched by the
//! final atomic rename, so a failed restore leaves it exactly as it
//! was (usually absent).
//!
//! Every delta is hash-verified before replay: the last 32 bytes of
//! the decompressed payload are the SHA-256 of the event array that
//! precedes them, and a mismatch aborts the whole restore.

use crate::compress::decompress_stream;
use crate::core::error::{TrellisError, TrellisResult};
use crate::kv::embedded::EmbeddedKv;
use crate::kv::{KvClient, TimedEvent};
use crate::ops::observability::MetricsRegistry;
use crate::snapshot::types::{sort_snapshots, Snapshot};
use crate::snapstore::SnapStore;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// SHA-256 digest length appended to delta payloads.
const DELTA_HASH_LEN: usize = 32;

/// Restore settings.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Base full snapshot to restore from.
    pub base_snapshot: Snapshot,

    /// Deltas following the base, any order; sorted before replay.
    pub delta_snapshots: Vec<Snapshot>,

    /// Target data directory.
    pub data_dir: PathBuf,

    /// Cluster name written into the restored directory marker.
    pub cluster_name: String,

    /// Member id the restored directory belongs to.
    pub member_id: String,

    /// Defragment the embedded KV after this many replayed events.
    pub defrag_event_batch: usize,

    /// Bound on the whole download-and-replay operation.
    pub restore_timeout: Duration,

    /// Bound on each defragmentation call.
    pub defrag_timeout: Duration,

    /// Backend quota for the embedded KV; a restored image above
    /// this size aborts the restore.
    pub embedded_quota_bytes: u64,
}

impl RestoreOptions {
    /// Path of the scratch directory the restore works in.
    pub fn part_dir(&self) -> PathBuf {
        let mut name = self
            .data_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".part");
        self.data_dir.with_file_name(name)
    }
}

/// Materialises a data directory from (base + deltas).
pub struct Restorer {
    store: Arc<dyn SnapStore>,
    metrics: Arc<MetricsRegistry>,
}

impl Restorer {
    /// Create a restorer reading from the given store.
    pub fn new(store: Arc<dyn SnapStore>, metrics: Arc<MetricsRegistry>) -> Self {
        Self { store, metrics }
    }

    /// Restore the chain and atomically swap the result into place.
    pub async fn restore(&self, options: &RestoreOptions) -> TrellisResult<()> {
        let part_dir = options.part_dir();
        remove_dir_if_present(&part_dir)?;

        let result = match tokio::time::timeout(
            options.restore_timeout,
            self.restore_into(options, &part_dir),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TrellisError::internal(format!(
                "restore timed out after {:?}",
                options.restore_timeout
            ))),
        };
        if result.is_err() {
            // The target directory is never touched on failure.
            remove_dir_if_present(&part_dir)?;
            return result;
        }

        remove_dir_if_present(&options.data_dir)?;
        std::fs::rename(&part_dir, &options.data_dir).map_err(|e| {
            TrellisError::internal(format!(
                "rename {} to {}: {e}",
                part_dir.display(),
                options.data_dir.display()
            ))
        })?;

        self.metrics.restorations.inc();
        tracing::info!(
            data_dir = %options.data_dir.display(),
            "successfully restored the kv data directory"
        );
        Ok(())
    }

    async fn restore_into(&self, options: &RestoreOptions, part_dir: &Path) -> TrellisResult<()> {
        tracing::info!(
            base = %options.base_snapshot.key(),
            deltas = options.delta_snapshots.len(),
            "restoring from snapshot chain"
        );

        let kv = self.restore_base(options, part_dir).await?;
        let result = self.apply_deltas(options, &kv).await;
        // Release the part directory lock whether replay succeeded
        // or not; on failure the whole directory is removed anyway.
        match kv.close() {
            Ok(()) => result,
            Err(close_err) if result.is_ok() => Err(close_err),
            Err(close_err) => {
                tracing::warn!(error = %close_err, "failed to close embedded kv after restore");
                result
            }
        }
    }

    async fn restore_base(
        &self,
        options: &RestoreOptions,
        part_dir: &Path,
    ) -> TrellisResult<EmbeddedKv> {
        let base = &options.base_snapshot;
        let raw = self.store.fetch(base).await?;
        let reader = decompress_stream(raw, &base.compression_suffix)?;

        let kv = EmbeddedKv::open(part_dir, &options.cluster_name, &options.member_id)?;
        let image_bytes = kv.restore_image(reader)?;
        if image_bytes as u64 > options.embedded_quota_bytes {
            return Err(TrellisError::integrity(format!(
                "database image of {image_bytes} bytes exceeds the embedded quota of {} bytes",
                options.embedded_quota_bytes
            )));
        }
        kv.persist()?;
        tracing::info!(revision = base.last_revision, "restored base snapshot");
        Ok(kv)
    }

    async fn apply_deltas(&self, options: &RestoreOptions, kv: &EmbeddedKv) -> TrellisResult<()> {
        let mut deltas = options.delta_snapshots.clone();
        sort_snapshots(&mut deltas);

        let mut expected_start = options.base_snapshot.last_revision + 1;
        let mut applied_events = 0usize;

        for delta in &deltas {
            if delta.start_revision != expected_start {
                return Err(TrellisError::integrity(format!(
                    "delta {} breaks chain contiguity: expected start revision {expected_start}",
                    delta.key()
                )));
            }

            let events = self.read_delta_events(delta).await?;
            let last_applied = events.last().map(|e| e.event.kv.mod_revision).unwrap_or(0);
            if last_applied != delta.last_revision {
                return Err(TrellisError::integrity(format!(
                    "delta {} event stream ends at revision {last_applied}, expected {}",
                    delta.key(),
                    delta.last_revision
                )));
            }

            for timed in &events {
                kv.apply_event(timed)?;
                applied_events += 1;
                if options.defrag_event_batch > 0
                    && applied_events % options.defrag_event_batch == 0
                {
                    tokio::time::timeout(options.defrag_timeout, kv.defragment())
                        .await
                        .map_err(|_| TrellisError::internal("defragmentation timed out"))??;
                }
            }
            tracing::info!(
                object = %delta.key(),
                events = events.len(),
                "applied delta snapshot"
            );
            expected_start = delta.last_revision + 1;
        }

        kv.persist()?;
        Ok(())
    }

    /// Fetch one delta, verify its hash, and decode its event array.
    async fn read_delta_events(&self, delta: &Snapshot) -> TrellisResult<Vec<TimedEvent>> {
        let raw = self.store.fetch(delta).await?;
        let mut reader = decompress_stream(raw, &delta.compression_suffix)?;
        let mut payload = Vec::new();
        reader
            .read_to_end(&mut payload)
            .map_err(|e| TrellisError::integrity(format!("read delta {}: {e}", delta.key())))?;

        if payload.len() < DELTA_HASH_LEN {
            return Err(TrellisError::integrity(format!(
                "delta {} is shorter than its hash trailer",
                delta.key()
            )));
        }
        let (body, stored_hash) = payload.split_at(payload.len() - DELTA_HASH_LEN);
        let computed = Sha256::digest(body);
        if computed.as_slice() != stored_hash {
            return Err(TrellisError::integrity(format!(
                "delta {} failed hash verification",
                delta.key()
            )));
        }

        let events: Vec<TimedEvent> = serde_json::from_slice(body).map_err(|e| {
            TrellisError::integrity(format!("decode delta {} events: {e}", delta.key()))
        })?;
        Ok(events)
    }
}

fn remove_dir_if_present(dir: &Path) -> TrellisResult<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TrellisError::internal(format!(
            "remove directory {}: {e}",
            dir.display()
        ))),
    }
}
