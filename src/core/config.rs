//! Configuration parsing and validation.
//!
//! Trellis configuration is loaded from TOML files with CLI
//! overrides. Sections mirror the sidecar's components: the KV
//! connection, the snapshotter, the snap store, compression, restore
//! behaviour, leader election, and telemetry.

use crate::compress::CompressionConfig;
use crate::core::schedule::{Schedule, DEFAULT_FULL_SNAPSHOT_SCHEDULE};
use crate::snapshot::gc::GarbageCollectionPolicy;
use crate::snapstore::{SnapstoreConfig, SnapstoreProvider};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level Trellis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// KV member connection and data directory.
    pub kv: KvConfig,

    /// Snapshot scheduling and garbage collection.
    #[serde(default)]
    pub snapshotter: SnapshotterSection,

    /// Snapshot object store.
    pub snapstore: SnapstoreConfig,

    /// Snapshot compression.
    #[serde(default)]
    pub compression: CompressionConfig,

    /// Restore behaviour.
    #[serde(default)]
    pub restore: RestoreSection,

    /// Leader election among peer sidecars.
    #[serde(default)]
    pub leader_election: LeaderElectionSection,

    /// Telemetry and logging.
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

/// KV member configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// KV member data directory.
    pub data_dir: PathBuf,

    /// Cluster this member belongs to.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// This member's identifier.
    #[serde(default = "default_member_id")]
    pub member_id: String,

    /// Configured cluster size; above 1 enables the multi-node
    /// initialization flow.
    #[serde(default = "default_cluster_size")]
    pub cluster_size: usize,

    /// Bound on point KV calls, in seconds.
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// Bound on full snapshot transfer, in seconds.
    #[serde(default = "default_snapshot_timeout_secs")]
    pub snapshot_timeout_secs: u64,

    /// Bound on backend defragmentation, in seconds.
    #[serde(default = "default_defrag_timeout_secs")]
    pub defrag_timeout_secs: u64,

    /// Backend quota handed to the embedded KV during restoration.
    #[serde(default = "default_embedded_quota_bytes")]
    pub embedded_quota_bytes: u64,

    /// Fail validation when the on-disk revision is below this floor;
    /// zero disables the check.
    #[serde(default)]
    pub fail_below_revision: u64,
}

/// Snapshot scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotterSection {
    /// Cron expression for full snapshots.
    #[serde(default = "default_full_snapshot_schedule")]
    pub full_snapshot_schedule: String,

    /// Delta snapshot period in seconds; below 1 disables deltas.
    #[serde(default = "default_delta_snapshot_period_secs")]
    pub delta_snapshot_period_secs: u64,

    /// Event buffer size that forces an early delta snapshot.
    #[serde(default = "default_delta_snapshot_memory_limit")]
    pub delta_snapshot_memory_limit: usize,

    /// Retention policy.
    #[serde(default = "default_gc_policy")]
    pub garbage_collection_policy: GarbageCollectionPolicy,

    /// Garbage collection period in seconds.
    #[serde(default = "default_gc_period_secs")]
    pub garbage_collection_period_secs: u64,

    /// Full chains retained under the limit-based policy.
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

impl Default for SnapshotterSection {
    fn default() -> Self {
        Self {
            full_snapshot_schedule: default_full_snapshot_schedule(),
            delta_snapshot_period_secs: default_delta_snapshot_period_secs(),
            delta_snapshot_memory_limit: default_delta_snapshot_memory_limit(),
            garbage_collection_policy: default_gc_policy(),
            garbage_collection_period_secs: default_gc_period_secs(),
            max_backups: default_max_backups(),
        }
    }
}

/// Restore configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreSection {
    /// Defragment the embedded KV after this many replayed events.
    #[serde(default = "default_defrag_event_batch")]
    pub defrag_event_batch: usize,

    /// Bound on the whole restore operation, in seconds.
    #[serde(default = "default_restore_timeout_secs")]
    pub restore_timeout_secs: u64,
}

impl Default for RestoreSection {
    fn default() -> Self {
        Self {
            defrag_event_batch: default_defrag_event_batch(),
            restore_timeout_secs: default_restore_timeout_secs(),
        }
    }
}

/// Leader election configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderElectionSection {
    /// Probe period in seconds.
    #[serde(default = "default_reelection_period_secs")]
    pub reelection_period_secs: u64,
}

impl Default for LeaderElectionSection {
    fn default() -> Self {
        Self {
            reelection_period_secs: default_reelection_period_secs(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySection {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Parsed snapshotter settings handed to the snapshotter itself.
#[derive(Debug, Clone)]
pub struct SnapshotterConfig {
    /// Cron expression for full snapshots.
    pub full_snapshot_schedule: String,

    /// Delta snapshot period.
    pub delta_snapshot_period: Duration,

    /// Event buffer size that forces an early delta snapshot.
    pub delta_snapshot_memory_limit: usize,

    /// Bound on point KV calls.
    pub connection_timeout: Duration,

    /// Bound on snapshot uploads.
    pub snapshot_timeout: Duration,
}

// Default value functions

fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_member_id() -> String {
    "member-0".to_string()
}

fn default_cluster_size() -> usize {
    1
}

fn default_connection_timeout_secs() -> u64 {
    30
}

fn default_snapshot_timeout_secs() -> u64 {
    900
}

fn default_defrag_timeout_secs() -> u64 {
    480
}

fn default_embedded_quota_bytes() -> u64 {
    8 * 1024 * 1024 * 1024
}

fn default_full_snapshot_schedule() -> String {
    DEFAULT_FULL_SNAPSHOT_SCHEDULE.to_string()
}

fn default_delta_snapshot_period_secs() -> u64 {
    20
}

fn default_delta_snapshot_memory_limit() -> usize {
    10 * 1024 * 1024
}

fn default_gc_policy() -> GarbageCollectionPolicy {
    GarbageCollectionPolicy::Exponential
}

fn default_gc_period_secs() -> u64 {
    60
}

fn default_max_backups() -> usize {
    7
}

fn default_defrag_event_batch() -> usize {
    5000
}

fn default_restore_timeout_secs() -> u64 {
    3600
}

fn default_reelection_period_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref data_dir) = overrides.data_dir {
            self.kv.data_dir = data_dir.clone();
        }
        if let Some(ref container) = overrides.storage_container {
            self.snapstore.container = container.clone();
        }
        if let Some(ref schedule) = overrides.full_snapshot_schedule {
            self.snapshotter.full_snapshot_schedule = schedule.clone();
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_kv()?;
        self.validate_snapshotter()?;
        self.validate_snapstore()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_kv(&self) -> Result<()> {
        if self.kv.data_dir.as_os_str().is_empty() {
            anyhow::bail!("kv.data_dir must not be empty");
        }
        if self.kv.cluster_size == 0 {
            anyhow::bail!("kv.cluster_size must be > 0");
        }
        if self.kv.connection_timeout_secs == 0 {
            anyhow::bail!("kv.connection_timeout_secs must be > 0");
        }
        if self.kv.snapshot_timeout_secs == 0 {
            anyhow::bail!("kv.snapshot_timeout_secs must be > 0");
        }
        Ok(())
    }

    fn validate_snapshotter(&self) -> Result<()> {
        Schedule::parse(&self.snapshotter.full_snapshot_schedule)
            .with_context(|| "invalid snapshotter.full_snapshot_schedule")?;

        if self.snapshotter.garbage_collection_period_secs == 0 {
            anyhow::bail!("snapshotter.garbage_collection_period_secs must be > 0");
        }
        if self.snapshotter.garbage_collection_policy == GarbageCollectionPolicy::LimitBased
            && self.snapshotter.max_backups == 0
        {
            anyhow::bail!("snapshotter.max_backups must be > 0 for the limit-based policy");
        }
        Ok(())
    }

    fn validate_snapstore(&self) -> Result<()> {
        if self.snapstore.container.is_empty()
            && self.snapstore.provider != SnapstoreProvider::Fake
        {
            anyhow::bail!(
                "snapstore.container required for provider {}",
                self.snapstore.provider
            );
        }
        if let Some(ref credentials) = self.snapstore.credentials_file {
            if !credentials.exists() {
                anyhow::bail!(
                    "snapstore.credentials_file does not exist: {}",
                    credentials.display()
                );
            }
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    /// Snapshotter settings derived from this configuration.
    pub fn snapshotter_config(&self) -> SnapshotterConfig {
        SnapshotterConfig {
            full_snapshot_schedule: self.snapshotter.full_snapshot_schedule.clone(),
            delta_snapshot_period: Duration::from_secs(self.snapshotter.delta_snapshot_period_secs),
            delta_snapshot_memory_limit: self.snapshotter.delta_snapshot_memory_limit,
            connection_timeout: Duration::from_secs(self.kv.connection_timeout_secs),
            snapshot_timeout: Duration::from_secs(self.kv.snapshot_timeout_secs),
        }
    }

    /// Garbage collection period.
    pub fn gc_period(&self) -> Duration {
        Duration::from_secs(self.snapshotter.garbage_collection_period_secs)
    }

    /// Leader election settings.
    pub fn leader_election_config(&self) -> crate::cluster::leader::LeaderElectionConfig {
        crate::cluster::leader::LeaderElectionConfig {
            reelection_period: Duration::from_secs(self.leader_election.reelection_period_secs),
            connection_timeout: Duration::from_secs(self.kv.connection_timeout_secs),
        }
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override the KV data directory.
    pub data_dir: Option<PathBuf>,
    /// Override the snap store container.
    pub storage_container: Option<String>,
    /// Override the full snapshot schedule.
    pub full_snapshot_schedule: Option<String>,
}
