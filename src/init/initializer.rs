//! Member startup initialization.
//!
//! Validates the local data directory and, when it is damaged or
//! missing, reconstructs it from the latest snapshot chain:
//!
//! - single-node: a valid directory is left alone; a corrupt one is
//!   wiped and restored from the store, or simply wiped when the
//!   store is empty (the store is the source of truth);
//! - multi-node: a member that was previously part of the cluster, or
//!   whose directory is invalid, is removed from the cluster, wiped,
//!   and rejoined as a learner; a detected scale-up also joins as a
//!   learner.
//!
//! The snap store scratch directory is cleaned and recreated here as
//! part of preparing for future snapshotting.

use crate::cluster::member::{MemberControl, ADD_LEARNER_ATTEMPTS};
use crate::init::validator::{DataDirStatus, DataValidator};
use crate::kv::KvClient;
use crate::ops::observability::MetricsRegistry;
use crate::snapshot::restorer::{RestoreOptions, Restorer};
use crate::snapstore::{get_snapstore, latest_full_and_deltas, SnapstoreConfig};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Initializer settings.
#[derive(Debug, Clone)]
pub struct InitializerConfig {
    /// KV member data directory.
    pub data_dir: PathBuf,

    /// Cluster this member belongs to.
    pub cluster_name: String,

    /// This member's identifier.
    pub member_id: String,

    /// Configured cluster size.
    pub cluster_size: usize,

    /// Revision consistency floor; zero disables the check.
    pub fail_below_revision: u64,

    /// Defragment the embedded KV after this many replayed events.
    pub defrag_event_batch: usize,

    /// Bound on the whole restore operation, in seconds.
    pub restore_timeout_secs: u64,

    /// Bound on each defragmentation call, in seconds.
    pub defrag_timeout_secs: u64,

    /// Backend quota handed to the embedded KV.
    pub embedded_quota_bytes: u64,

    /// Snap store settings; absent when no store is configured.
    pub snapstore: Option<SnapstoreConfig>,
}

/// Validates and, if needed, restores the member data directory.
pub struct Initializer {
    config: InitializerConfig,
    kv: Arc<dyn KvClient>,
    metrics: Arc<MetricsRegistry>,
}

impl Initializer {
    /// Create an initializer.
    pub fn new(
        config: InitializerConfig,
        kv: Arc<dyn KvClient>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            kv,
            metrics,
        }
    }

    /// Run the initialization flow.
    pub async fn initialize(&self) -> Result<()> {
        self.metrics
            .cluster_size
            .set(self.config.cluster_size as i64);

        let mut member_heartbeat_present = false;
        if self.config.cluster_size > 1 {
            let member = MemberControl::new(Arc::clone(&self.kv), &self.config.member_id);

            member_heartbeat_present = member.was_member_in_cluster().await;
            if member_heartbeat_present {
                tracing::info!("member found to be already a part of the cluster, skipping the scale-up check");
            } else {
                tracing::info!("member heartbeat is not present, starting the scale-up check");
                match member.is_cluster_scaled_up(self.config.cluster_size).await {
                    Err(err) => {
                        tracing::warn!(error = %err, "scale-up not detected");
                    }
                    Ok(true) => {
                        tracing::info!("cluster scale-up detected, joining as learner");
                        member
                            .add_learner_with_retry(ADD_LEARNER_ATTEMPTS, &self.config.data_dir)
                            .await
                            .context("unable to add member as learner")?;
                        // A fresh learner syncs from the cluster; no
                        // validation or restoration needed.
                        return Ok(());
                    }
                    Ok(false) => {}
                }
            }
        }

        let validator = DataValidator::new(
            self.config.data_dir.clone(),
            &self.config.cluster_name,
            self.config.cluster_size,
            Arc::clone(&self.metrics),
        );
        let status = validator.validate(self.config.fail_below_revision);

        match status {
            DataDirStatus::WrongVolumeMounted => {
                anyhow::bail!("will not initialize because a wrong volume is mounted");
            }
            DataDirStatus::FailToOpenDb => {
                anyhow::bail!("failed to initialize since another process still holds the data directory lock");
            }
            DataDirStatus::Unknown => {
                anyhow::bail!("data directory validation failed");
            }
            DataDirStatus::FailBelowRevisionConsistency => {
                anyhow::bail!("failed to initialize since the below-revision consistency check failed");
            }
            DataDirStatus::Valid => {}
            DataDirStatus::InvalidInMultiNode | DataDirStatus::Corrupt => {
                let multi_node_restore = status == DataDirStatus::InvalidInMultiNode
                    || (self.config.cluster_size > 1 && member_heartbeat_present);
                if multi_node_restore {
                    self.restore_in_multi_node().await?;
                } else {
                    self.restore_corrupt_data().await?;
                }
            }
        }

        self.prepare_temp_dir()?;
        Ok(())
    }

    /// Restore a corrupt single-node directory from the store, or
    /// wipe it when the store is empty.
    async fn restore_corrupt_data(&self) -> Result<bool> {
        let Some(store_config) = &self.config.snapstore else {
            tracing::warn!("no snap store storage provider configured");
            return self.restore_with_empty_snapstore();
        };

        let store = get_snapstore(store_config).context("failed to create snap store")?;
        tracing::info!("finding latest set of snapshots to recover from");
        let (base, deltas) = latest_full_and_deltas(store.as_ref())
            .await
            .context("failed to get latest set of snapshots")?;

        let Some(base) = base else {
            // The store is the source of truth: empty store means the
            // data directory must go.
            tracing::info!("no snapshot found, will remove the data directory");
            return self.restore_with_empty_snapstore();
        };

        let restorer = Restorer::new(store, Arc::clone(&self.metrics));
        let options = RestoreOptions {
            base_snapshot: base,
            delta_snapshots: deltas,
            data_dir: self.config.data_dir.clone(),
            cluster_name: self.config.cluster_name.clone(),
            member_id: self.config.member_id.clone(),
            defrag_event_batch: self.config.defrag_event_batch,
            restore_timeout: std::time::Duration::from_secs(self.config.restore_timeout_secs),
            defrag_timeout: std::time::Duration::from_secs(self.config.defrag_timeout_secs),
            embedded_quota_bytes: self.config.embedded_quota_bytes,
        };
        restorer
            .restore(&options)
            .await
            .context("failed to restore snapshot")?;
        tracing::info!("successfully restored the kv data directory");
        Ok(true)
    }

    /// Remove the data directory for the empty-store case.
    ///
    /// Returns true if a directory was actually removed, false when
    /// bootstrapping a directory that never existed.
    fn restore_with_empty_snapstore(&self) -> Result<bool> {
        let data_dir = &self.config.data_dir;
        tracing::info!(data_dir = %data_dir.display(), "removing directory since snap store is empty");

        if !data_dir.exists() {
            return Ok(false);
        }
        remove_dir(data_dir)?;
        Ok(true)
    }

    /// Multi-node restoration: leave the cluster, wipe the
    /// directory, rejoin as a learner.
    async fn restore_in_multi_node(&self) -> Result<()> {
        let member = MemberControl::new(Arc::clone(&self.kv), &self.config.member_id);

        member
            .remove_member_with_retry(ADD_LEARNER_ATTEMPTS)
            .await
            .context("unable to remove the member")?;

        if self.config.data_dir.exists() {
            remove_dir(&self.config.data_dir).context("unable to remove the data directory")?;
        }

        member
            .add_learner_with_retry(ADD_LEARNER_ATTEMPTS, &self.config.data_dir)
            .await
            .context("unable to add the member as learner")?;
        Ok(())
    }

    /// Clean and recreate the snap store scratch directory.
    fn prepare_temp_dir(&self) -> Result<()> {
        let Some(store_config) = &self.config.snapstore else {
            tracing::info!("no snap store configured, skipping temporary directory cleanup");
            return Ok(());
        };

        let temp_dir = &store_config.temp_dir;
        if temp_dir.as_os_str() != "/tmp" && temp_dir.exists() {
            remove_dir(temp_dir)?;
        }
        tracing::info!(temp_dir = %temp_dir.display(), "creating temporary directory");
        std::fs::create_dir_all(temp_dir)
            .with_context(|| format!("failed to create temporary directory {}", temp_dir.display()))?;
        Ok(())
    }
}

fn remove_dir(dir: &Path) -> Result<()> {
    tracing::info!(dir = %dir.display(), "removing directory");
    std::fs::remove_dir_all(dir)
        .with_context(|| format!("failed to remove directory {}", dir.display()))
}
