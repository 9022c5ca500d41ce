//! Cluster membership control.
//!
//! Wraps the membership calls of the KV client facade with the retry
//! behaviour the initializer needs: rejoining a multi-node cluster
//! removes the stale member, wipes the directory, and re-adds it as a
//! non-voting learner, each with bounded retries.

use crate::core::error::{TrellisError, TrellisResult};
use crate::kv::KvClient;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Attempts made to add a learner before giving up.
pub const ADD_LEARNER_ATTEMPTS: u32 = 6;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Membership operations for the local member.
pub struct MemberControl {
    kv: Arc<dyn KvClient>,
    member_id: String,
}

impl MemberControl {
    /// Create a controller for the given member.
    pub fn new(kv: Arc<dyn KvClient>, member_id: &str) -> Self {
        Self {
            kv,
            member_id: member_id.to_string(),
        }
    }

    /// Whether this member is currently part of the cluster.
    pub async fn was_member_in_cluster(&self) -> bool {
        match self.kv.member_list().await {
            Ok(members) => members.contains(&self.member_id),
            Err(err) => {
                tracing::warn!(error = %err, "cannot list cluster members");
                false
            }
        }
    }

    /// Whether the cluster has grown beyond its current membership.
    pub async fn is_cluster_scaled_up(&self, configured_size: usize) -> TrellisResult<bool> {
        let members = self.kv.member_list().await?;
        Ok(configured_size > members.len())
    }

    /// Add this member back as a learner, retrying a bounded number
    /// of times. The data directory is re-checked before every
    /// attempt so a partially created one never survives into the
    /// join.
    pub async fn add_learner_with_retry(
        &self,
        attempts: u32,
        data_dir: &Path,
    ) -> TrellisResult<()> {
        let mut last_err = TrellisError::kv("no add-learner attempt made");
        for attempt in 1..=attempts {
            if data_dir.exists() {
                std::fs::remove_dir_all(data_dir).map_err(|e| {
                    TrellisError::internal(format!(
                        "remove data dir before learner join: {e}"
                    ))
                })?;
            }
            match self.kv.add_learner().await {
                Ok(()) => {
                    tracing::info!(attempt, "added member as learner");
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "adding learner failed");
                    last_err = err;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
        Err(last_err)
    }

    /// Remove this member from the cluster, retrying transiently.
    pub async fn remove_member_with_retry(&self, attempts: u32) -> TrellisResult<()> {
        let mut last_err = TrellisError::kv("no remove-member attempt made");
        for attempt in 1..=attempts {
            match self.kv.remove_member().await {
                Ok(()) => {
                    tracing::info!(attempt, "removed member from cluster");
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "removing member failed");
                    last_err = err;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
        Err(last_err)
    }

    /// Promote this member from learner to voting member.
    pub async fn promote(&self) -> TrellisResult<()> {
        self.kv.promote_learner().await
    }
}
