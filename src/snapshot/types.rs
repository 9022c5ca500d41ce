//! Snapshot descriptors and the object name grammar.
//!
//! Every stored artifact is described by a [`Snapshot`]. The object
//! key is derived from the descriptor and round-trips through
//! [`Snapshot::parse`]:
//!
//! ```text
//! v2/<kind>-<start>-<last>-<unixts>[.<suffix>]
//! ```
//!
//! `<kind>` is `Full` or `Incr`, `<start>` and `<last>` are
//! zero-padded hexadecimal revisions, `<unixts>` is the creation time
//! in decimal unix seconds. The historical `v1` directory is
//! recognised on read but never written.
//!
//! The grammar is closed: nothing else is ever part of a name.
//! Finality in particular is an in-memory attribute only; a final
//! full snapshot is observable in the store solely through the
//! chain-discovery semantics (no deltas ever follow it).

use crate::core::error::{TrellisError, TrellisResult};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Current snapshot directory version, used for all writes.
pub const SNAP_DIR_V2: &str = "v2";

/// Legacy snapshot directory version, recognised on read only.
pub const SNAP_DIR_V1: &str = "v1";

/// Object tag hiding a version from chain discovery.
pub const EXCLUDE_TAG_KEY: &str = "x-etcd-snapshot-exclude";

/// Kind of a stored snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotKind {
    /// Byte-image of the whole KV database.
    Full,
    /// Ordered sequence of timestamped events.
    Delta,
}

impl SnapshotKind {
    /// Label used in object names.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Full => "Full",
            Self::Delta => "Incr",
        }
    }

    /// Parse an object-name label.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "Full" => Some(Self::Full),
            "Incr" => Some(Self::Delta),
            _ => None,
        }
    }

    /// Sort priority: Full sorts before Delta at revision ties.
    fn priority(&self) -> u8 {
        match self {
            Self::Full => 0,
            Self::Delta => 1,
        }
    }
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Descriptor for one stored snapshot artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Full or Delta.
    pub kind: SnapshotKind,

    /// Smallest revision included (inclusive).
    pub start_revision: u64,

    /// Largest revision included (inclusive).
    pub last_revision: u64,

    /// Wall-clock creation time.
    pub created_on: DateTime<Utc>,

    /// Grouping prefix within the store ("v2" for all writes).
    pub snap_dir: String,

    /// Object key leaf.
    pub snap_name: String,

    /// Compression suffix; empty string means uncompressed.
    pub compression_suffix: String,

    /// True for partial pieces of a multipart upload.
    pub is_chunk: bool,

    /// True for a full snapshot that terminates its generation.
    ///
    /// Not encoded in the object name; meaningful only on
    /// descriptors held by the snapshotter that wrote them.
    pub is_final: bool,
}

impl Snapshot {
    /// Create a snapshot descriptor and derive its object name.
    pub fn new(
        kind: SnapshotKind,
        start_revision: u64,
        last_revision: u64,
        compression_suffix: &str,
        is_final: bool,
    ) -> Self {
        Self::new_at(
            kind,
            start_revision,
            last_revision,
            compression_suffix,
            is_final,
            Utc::now(),
        )
    }

    /// Create a snapshot descriptor with an explicit creation time.
    ///
    /// The time is embedded in the object name, so it must be fixed
    /// before the name is derived.
    pub fn new_at(
        kind: SnapshotKind,
        start_revision: u64,
        last_revision: u64,
        compression_suffix: &str,
        is_final: bool,
        created_on: DateTime<Utc>,
    ) -> Self {
        let mut snap = Self {
            kind,
            start_revision,
            last_revision,
            created_on,
            snap_dir: SNAP_DIR_V2.to_string(),
            snap_name: String::new(),
            compression_suffix: compression_suffix.to_string(),
            is_chunk: false,
            is_final,
        };
        snap.snap_name = snap.generate_name();
        snap
    }

    fn generate_name(&self) -> String {
        format!(
            "{}-{:016x}-{:016x}-{}{}",
            self.kind.label(),
            self.start_revision,
            self.last_revision,
            self.created_on.timestamp(),
            self.compression_suffix,
        )
    }

    /// Object key relative to the configured store prefix.
    pub fn key(&self) -> String {
        format!("{}/{}", self.snap_dir, self.snap_name)
    }

    /// Parse an object key of the form `<dir>/<name>`.
    ///
    /// Returns an error for keys that do not match the snapshot name
    /// grammar; listing code uses this to skip foreign objects.
    pub fn parse(key: &str) -> TrellisResult<Self> {
        let invalid = || TrellisError::InvalidSnapshotName {
            name: key.to_string(),
        };

        let (dir, name) = key.rsplit_once('/').ok_or_else(invalid)?;
        let dir = dir.rsplit('/').next().unwrap_or(dir);
        if dir != SNAP_DIR_V2 && dir != SNAP_DIR_V1 {
            return Err(invalid());
        }

        let mut rest = name;
        let mut compression_suffix = String::new();
        for suffix in crate::compress::RECOGNISED_SUFFIXES {
            if let Some(stripped) = rest.strip_suffix(suffix) {
                compression_suffix = suffix.to_string();
                rest = stripped;
                break;
            }
        }

        let mut parts = rest.splitn(2, '-');
        let kind = parts
            .next()
            .and_then(SnapshotKind::from_label)
            .ok_or_else(invalid)?;
        let fields: Vec<&str> = parts.next().ok_or_else(invalid)?.split('-').collect();
        if fields.len() != 3 {
            return Err(invalid());
        }

        let start_revision = u64::from_str_radix(fields[0], 16).map_err(|_| invalid())?;
        let last_revision = u64::from_str_radix(fields[1], 16).map_err(|_| invalid())?;
        let unix_ts: i64 = fields[2].parse().map_err(|_| invalid())?;
        let created_on = Utc
            .timestamp_opt(unix_ts, 0)
            .single()
            .ok_or_else(invalid)?;

        if start_revision > last_revision {
            return Err(invalid());
        }

        Ok(Self {
            kind,
            start_revision,
            last_revision,
            created_on,
            snap_dir: dir.to_string(),
            snap_name: name.to_string(),
            compression_suffix,
            is_chunk: false,
            // Finality does not round-trip through the store.
            is_final: false,
        })
    }
}

/// Ascending store order: `(start_revision, last_revision,
/// created_on)` with Full before Delta at ties.
pub fn compare_snapshots(a: &Snapshot, b: &Snapshot) -> Ordering {
    a.start_revision
        .cmp(&b.start_revision)
        .then(a.last_revision.cmp(&b.last_revision))
        .then(a.created_on.cmp(&b.created_on))
        .then(a.kind.priority().cmp(&b.kind.priority()))
}

/// Sort a snapshot list into canonical store order.
pub fn sort_snapshots(snaps: &mut [Snapshot]) {
    snaps.sort_by(compare_snapshots);
}
