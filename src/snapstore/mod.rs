//! Provider-agnostic snapshot object store.
//!
//! A [`SnapStore`] stores snapshot artifacts under a configured
//! prefix and knows nothing about scheduling or retention. Providers:
//!
//! - [`local::LocalSnapStore`] - filesystem directory
//! - [`fake::FakeSnapStore`] - in-memory, versioning-capable; used by
//!   the scenario tests
//! - [`object::ObjectSnapStore`] - S3, ABS, GCS and S3-compatible
//!   services (Swift, OSS, OCS, ECS) through the `object_store` crate
//!
//! Listing returns only objects whose keys match the snapshot name
//! grammar, sorted ascending by `(start_revision, last_revision,
//! created_on)` with Full before Delta at ties, and surfaces only the
//! latest version of each key. The fake store additionally models
//! per-version `x-etcd-snapshot-exclude` tags and an object-lock
//! retention window; the cloud store's provider-neutral client cannot
//! read tags or bucket lock configuration, so its retention window is
//! supplied through [`SnapstoreConfig::object_lock_retention_secs`]
//! and tag-based hiding is left to the tooling that sets the tags
//! (see [`object`]).

pub mod fake;
pub mod local;
pub mod object;

use crate::core::error::{TrellisError, TrellisResult};
use crate::snapshot::types::{sort_snapshots, Snapshot, SnapshotKind};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

/// Minimum stream size before providers switch to multipart upload.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Supported storage providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapstoreProvider {
    S3,
    #[serde(rename = "ABS")]
    Abs,
    #[serde(rename = "GCS")]
    Gcs,
    Swift,
    #[serde(rename = "OSS")]
    Oss,
    #[serde(rename = "OCS")]
    Ocs,
    #[serde(rename = "ECS")]
    Ecs,
    Local,
    Fake,
}

impl SnapstoreProvider {
    /// Environment variable naming the credentials file for this
    /// provider, if any.
    pub fn credentials_env(&self) -> Option<&'static str> {
        match self {
            Self::S3 | Self::Oss | Self::Ocs | Self::Ecs => Some("AWS_APPLICATION_CREDENTIALS"),
            Self::Abs => Some("AZURE_APPLICATION_CREDENTIALS"),
            Self::Gcs => Some("GOOGLE_APPLICATION_CREDENTIALS"),
            Self::Swift => Some("OPENSTACK_APPLICATION_CREDENTIALS"),
            Self::Local | Self::Fake => None,
        }
    }
}

impl std::fmt::Display for SnapstoreProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::S3 => "S3",
            Self::Abs => "ABS",
            Self::Gcs => "GCS",
            Self::Swift => "Swift",
            Self::Oss => "OSS",
            Self::Ocs => "OCS",
            Self::Ecs => "ECS",
            Self::Local => "Local",
            Self::Fake => "Fake",
        };
        f.write_str(name)
    }
}

/// Snap store construction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapstoreConfig {
    /// Storage provider backing this store.
    pub provider: SnapstoreProvider,

    /// Bucket / container / root directory.
    pub container: String,

    /// Key prefix inside the container.
    #[serde(default)]
    pub prefix: String,

    /// Local scratch directory; cleaned and recreated at init.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Explicit credentials file; overrides the provider env probe.
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,

    /// Endpoint override for S3-compatible providers.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Object-lock retention period enforced by the bucket, in
    /// seconds.
    ///
    /// The provider-neutral cloud client cannot probe the bucket's
    /// lock configuration, so deployments against a locked bucket
    /// state it here; the garbage collector skips objects still
    /// inside the window.
    #[serde(default)]
    pub object_lock_retention_secs: Option<u64>,
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

/// Object-addressed blob store for snapshots.
#[async_trait]
pub trait SnapStore: Send + Sync {
    /// Read a snapshot's bytes.
    async fn fetch(&self, snap: &Snapshot) -> TrellisResult<Box<dyn Read + Send>>;

    /// Write a snapshot, consuming the reader to exhaustion.
    ///
    /// Streams above the provider chunk threshold are uploaded in
    /// parts and finalised with a manifest; a failed upload leaves no
    /// visible object.
    async fn save(&self, snap: &Snapshot, reader: Box<dyn Read + Send>) -> TrellisResult<()>;

    /// Enumerate snapshots under the configured prefixes, sorted.
    async fn list(&self) -> TrellisResult<Vec<Snapshot>>;

    /// Delete a snapshot object.
    async fn delete(&self, snap: &Snapshot) -> TrellisResult<()>;

    /// Size of the stored object in bytes.
    async fn size(&self, snap: &Snapshot) -> TrellisResult<i64>;

    /// Bucket-level object-lock retention period, if enforced.
    fn retention_period(&self) -> Option<Duration> {
        None
    }
}

/// Build a snap store for the configured provider.
pub fn get_snapstore(config: &SnapstoreConfig) -> TrellisResult<Arc<dyn SnapStore>> {
    match config.provider {
        SnapstoreProvider::Local => Ok(Arc::new(local::LocalSnapStore::new(
            PathBuf::from(&config.container),
            &config.prefix,
        )?)),
        SnapstoreProvider::Fake => {
            let store = fake::FakeSnapStore::new(&config.prefix);
            if let Some(secs) = config.object_lock_retention_secs {
                store.set_retention_period(Duration::seconds(secs as i64));
            }
            Ok(Arc::new(store))
        }
        _ => Ok(Arc::new(object::ObjectSnapStore::new(config)?)),
    }
}

/// Most recent modification time of the credentials backing the
/// configured provider.
///
/// Local and Fake stores carry no credentials; their modification
/// time is fixed at the epoch so rotation is never detected.
pub fn snapstore_secret_modified_time(
    config: &SnapstoreConfig,
) -> TrellisResult<DateTime<Utc>> {
    let path = match &config.credentials_file {
        Some(path) => path.clone(),
        None => {
            let Some(env) = config.provider.credentials_env() else {
                return Ok(DateTime::<Utc>::UNIX_EPOCH);
            };
            match std::env::var_os(env) {
                Some(path) => PathBuf::from(path),
                None => return Ok(DateTime::<Utc>::UNIX_EPOCH),
            }
        }
    };

    let metadata = std::fs::metadata(&path).map_err(|e| {
        TrellisError::configuration(format!(
            "cannot stat credentials file {}: {e}",
            path.display()
        ))
    })?;
    let modified = metadata.modified().map_err(|e| {
        TrellisError::configuration(format!("credentials mtime unavailable: {e}"))
    })?;
    Ok(DateTime::<Utc>::from(modified))
}

/// Latest full snapshot and the contiguous deltas that follow it.
///
/// Ties on `created_on` break by `last_revision` through the list
/// ordering. A full that closed its generation has no trailing
/// deltas, so the returned chain is empty past it.
pub async fn latest_full_and_deltas(
    store: &dyn SnapStore,
) -> TrellisResult<(Option<Snapshot>, Vec<Snapshot>)> {
    let snaps = store.list().await?;

    let Some(full_idx) = snaps
        .iter()
        .rposition(|s| s.kind == SnapshotKind::Full && !s.is_chunk)
    else {
        return Ok((None, Vec::new()));
    };
    let full = snaps[full_idx].clone();

    let mut deltas: Vec<Snapshot> = snaps[full_idx + 1..]
        .iter()
        .filter(|s| s.kind == SnapshotKind::Delta && s.start_revision > full.last_revision)
        .cloned()
        .collect();
    sort_snapshots(&mut deltas);
    Ok((Some(full), deltas))
}

/// Parse and sort raw object keys into snapshot descriptors,
/// dropping keys that do not match the name grammar.
pub(crate) fn snapshots_from_keys<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<Snapshot> {
    let mut snaps: Vec<Snapshot> = keys.filter_map(|key| Snapshot::parse(key).ok()).collect();
    sort_snapshots(&mut snaps);
    snaps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_display() {
        assert_eq!(SnapstoreProvider::S3.to_string(), "S3");
        assert_eq!(SnapstoreProvider::Fake.to_string(), "Fake");
    }

    #[test]
    fn test_secret_mtime_for_credential_free_provider() {
        let config = SnapstoreConfig {
            provider: SnapstoreProvider::Fake,
            container: "bucket".to_string(),
            prefix: String::new(),
            temp_dir: default_temp_dir(),
            credentials_file: None,
            endpoint: None,
            object_lock_retention_secs: None,
        };
        let mtime = snapstore_secret_modified_time(&config).unwrap();
        assert_eq!(mtime, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn test_factory_applies_configured_retention() {
        let config = SnapstoreConfig {
            provider: SnapstoreProvider::Fake,
            container: String::new(),
            prefix: String::new(),
            temp_dir: default_temp_dir(),
            credentials_file: None,
            endpoint: None,
            object_lock_retention_secs: Some(48 * 3600),
        };
        let store = get_snapstore(&config).unwrap();
        assert_eq!(store.retention_period(), Some(Duration::hours(48)));
    }

    #[test]
    fn test_snapshots_from_keys_skips_foreign_objects() {
        let keys = [
            "v2/Full-0000000000000000-000000000000000a-1700000000",
            "v2/Incr-000000000000000b-0000000000000014-1700000100",
            "v2/README.txt",
            "logs/2024.log",
        ];
        let snaps = snapshots_from_keys(keys.iter().copied());
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].kind, SnapshotKind::Full);
        assert_eq!(snaps[1].start_revision, 0xb);
    }
}
