//! Policy-driven retention pruner.
//!
//! Runs on a fixed period against the snap store. Two policies:
//!
//! - **Exponential** - keep everything from the last hour, the most
//!   recent full per hour for the last 24 hours, one full per day for
//!   the last 7 days, and one full per week beyond that.
//! - **Limit-based** - keep the most recent `max_backups` full
//!   chains.
//!
//! Deltas live and die with their chain-starting full, and a chain is
//! always deleted deltas-first so concurrent readers never observe a
//! delta without its base. Objects still inside an object-lock
//! retention window are skipped, not errored on; deletion is retried
//! on the next cycle.

use crate::core::error::TrellisResult;
use crate::ops::observability::MetricsRegistry;
use crate::snapshot::types::{Snapshot, SnapshotKind};
use crate::snapstore::SnapStore;
use chrono::{DateTime, Datelike, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Retention policy for stored snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GarbageCollectionPolicy {
    Exponential,
    LimitBased,
}

/// One full snapshot plus the contiguous deltas that follow it.
#[derive(Debug, Clone)]
struct Chain {
    full: Snapshot,
    deltas: Vec<Snapshot>,
}

/// Policy-driven retention pruner over snap store contents.
pub struct GarbageCollector {
    store: Arc<dyn SnapStore>,
    policy: GarbageCollectionPolicy,
    period: Duration,
    max_backups: usize,
    metrics: Arc<MetricsRegistry>,
}

impl GarbageCollector {
    /// Create a collector over the given store.
    pub fn new(
        store: Arc<dyn SnapStore>,
        policy: GarbageCollectionPolicy,
        period: Duration,
        max_backups: usize,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            store,
            policy,
            period,
            max_backups,
            metrics,
        }
    }

    /// Run collection cycles until stopped.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        tracing::info!(policy = ?self.policy, period = ?self.period, "starting garbage collector");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.period) => {
                    match self.collect(Utc::now()).await {
                        Ok(deleted) if deleted > 0 => {
                            tracing::info!(deleted, "garbage collection cycle finished");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            self.metrics.gc_errors.inc();
                            tracing::warn!(error = %err, "garbage collection cycle failed");
                        }
                    }
                }
                _ = stop.changed() => {
                    tracing::info!("stopping garbage collector");
                    return;
                }
            }
        }
    }

    /// Run one collection cycle; returns the number of deleted
    /// objects.
    pub async fn collect(&self, now: DateTime<Utc>) -> TrellisResult<usize> {
        let snaps = self.store.list().await?;
        let (chains, orphan_deltas) = build_chains(&snaps);
        if chains.is_empty() && orphan_deltas.is_empty() {
            return Ok(0);
        }

        let retained = match self.policy {
            GarbageCollectionPolicy::Exponential => self.retained_exponential(&chains, now),
            GarbageCollectionPolicy::LimitBased => self.retained_limit_based(&chains),
        };

        let mut deleted = 0;

        // Deltas whose chain-starting full is already gone.
        for delta in &orphan_deltas {
            if self.policy == GarbageCollectionPolicy::Exponential
                && within_last_hour(delta, now)
            {
                continue;
            }
            deleted += self.delete_unless_locked(delta, now).await?;
        }

        for chain in &chains {
            if retained.contains(&chain.full.snap_name) {
                continue;
            }
            // Deltas first, then the base, so the chain stays valid
            // for any concurrent reader.
            let mut chain_fully_deleted = true;
            for delta in chain.deltas.iter().rev() {
                if self.policy == GarbageCollectionPolicy::Exponential
                    && within_last_hour(delta, now)
                {
                    chain_fully_deleted = false;
                    continue;
                }
                match self.delete_unless_locked(delta, now).await? {
                    0 => chain_fully_deleted = false,
                    n => deleted += n,
                }
            }
            if chain_fully_deleted {
                deleted += self.delete_unless_locked(&chain.full, now).await?;
            }
        }

        self.metrics.gc_deleted.add(deleted as u64);
        Ok(deleted)
    }

    /// Delete one object, skipping (not erroring) objects still
    /// inside the store's object-lock retention window.
    async fn delete_unless_locked(
        &self,
        snap: &Snapshot,
        now: DateTime<Utc>,
    ) -> TrellisResult<usize> {
        if let Some(retention) = self.store.retention_period() {
            if snap.created_on + retention > now {
                tracing::debug!(
                    object = %snap.key(),
                    "object is inside its retention window, skipping deletion"
                );
                return Ok(0);
            }
        }
        tracing::info!(object = %snap.key(), "garbage collecting snapshot");
        self.store.delete(snap).await?;
        Ok(1)
    }

    /// Exponential retention: everything from the last hour, then the
    /// most recent full per hour, per day, per week as age grows.
    fn retained_exponential(&self, chains: &[Chain], now: DateTime<Utc>) -> HashSet<String> {
        let mut retained = HashSet::new();
        let mut hourly_seen = HashSet::new();
        let mut daily_seen = HashSet::new();
        let mut weekly_seen = HashSet::new();

        for chain in chains.iter().rev() {
            let full = &chain.full;
            let age = now - full.created_on;

            if age < chrono::Duration::hours(1) {
                retained.insert(full.snap_name.clone());
                continue;
            }
            if age < chrono::Duration::hours(24) {
                let bucket = full
                    .created_on
                    .duration_trunc(chrono::Duration::hours(1))
                    .unwrap_or(full.created_on);
                if hourly_seen.insert(bucket) {
                    retained.insert(full.snap_name.clone());
                }
                continue;
            }
            if age < chrono::Duration::days(7) {
                let bucket = full.created_on.date_naive();
                if daily_seen.insert(bucket) {
                    retained.insert(full.snap_name.clone());
                }
                continue;
            }
            let week = full.created_on.iso_week();
            if weekly_seen.insert((week.year(), week.week())) {
                retained.insert(full.snap_name.clone());
            }
        }
        retained
    }

    /// Limit-based retention: the most recent `max_backups` fulls.
    fn retained_limit_based(&self, chains: &[Chain]) -> HashSet<String> {
        chains
            .iter()
            .rev()
            .take(self.max_backups)
            .map(|c| c.full.snap_name.clone())
            .collect()
    }
}

fn within_last_hour(snap: &Snapshot, now: DateTime<Utc>) -> bool {
    now - snap.created_on < chrono::Duration::hours(1)
}

/// Group a sorted snapshot list into chains. Deltas preceding any
/// full are returned separately as orphans.
fn build_chains(snaps: &[Snapshot]) -> (Vec<Chain>, Vec<Snapshot>) {
    let mut chains: Vec<Chain> = Vec::new();
    let mut orphans = Vec::new();

    for snap in snaps {
        if snap.is_chunk {
            continue;
        }
        match snap.kind {
            SnapshotKind::Full => chains.push(Chain {
                full: snap.clone(),
                deltas: Vec::new(),
            }),
            SnapshotKind::Delta => match chains.last_mut() {
                Some(chain) if snap.start_revision > chain.full.last_revision => {
                    chain.deltas.push(snap.clone());
                }
                _ => orphans.push(snap.clone()),
            },
        }
    }
    (chains, orphans)
}
