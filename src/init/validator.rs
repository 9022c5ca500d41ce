//! Local data-directory sanity checks.
//!
//! The validator inspects the KV member's data directory and reports
//! a status; the initializer decides what each status triggers. It
//! never mutates the directory.

use crate::kv::embedded::{DbImage, CLUSTER_MARKER_FILE, DB_FILE, LOCK_FILE};
use crate::ops::observability::MetricsRegistry;
use std::path::PathBuf;
use std::sync::Arc;

/// Outcome of a data directory validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirStatus {
    /// Directory is present and consistent.
    Valid,
    /// Directory is missing, empty, or its database is unreadable.
    Corrupt,
    /// Directory belongs to a different cluster.
    WrongVolumeMounted,
    /// Another process holds the directory lock.
    FailToOpenDb,
    /// On-disk revision is below the configured consistency floor.
    FailBelowRevisionConsistency,
    /// Directory is invalid and this member is part of a multi-node
    /// cluster.
    InvalidInMultiNode,
    /// Validation itself failed.
    Unknown,
}

/// Validates the local KV data directory.
pub struct DataValidator {
    data_dir: PathBuf,
    cluster_name: String,
    original_cluster_size: usize,
    metrics: Arc<MetricsRegistry>,
}

impl DataValidator {
    /// Create a validator for the given directory.
    pub fn new(
        data_dir: PathBuf,
        cluster_name: &str,
        original_cluster_size: usize,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            data_dir,
            cluster_name: cluster_name.to_string(),
            original_cluster_size,
            metrics,
        }
    }

    /// Validate the data directory.
    ///
    /// `fail_below_revision` above zero additionally requires the
    /// on-disk revision to be at or above that floor.
    pub fn validate(&self, fail_below_revision: u64) -> DataDirStatus {
        self.metrics.validations.inc();
        let status = self.validate_inner(fail_below_revision);
        tracing::info!(
            data_dir = %self.data_dir.display(),
            status = ?status,
            "validated data directory"
        );

        if status == DataDirStatus::Corrupt && self.original_cluster_size > 1 {
            return DataDirStatus::InvalidInMultiNode;
        }
        status
    }

    fn validate_inner(&self, fail_below_revision: u64) -> DataDirStatus {
        if !self.data_dir.exists() {
            return DataDirStatus::Corrupt;
        }

        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries.count(),
            Err(e) => {
                tracing::warn!(error = %e, "cannot read data directory");
                return DataDirStatus::Unknown;
            }
        };
        if entries == 0 {
            return DataDirStatus::Corrupt;
        }

        if self.data_dir.join(LOCK_FILE).exists() {
            return DataDirStatus::FailToOpenDb;
        }

        match std::fs::read_to_string(self.data_dir.join(CLUSTER_MARKER_FILE)) {
            Ok(marker) if marker == self.cluster_name => {}
            Ok(_) => return DataDirStatus::WrongVolumeMounted,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Non-empty directory without our marker is some
                // other volume mounted in our place.
                return DataDirStatus::WrongVolumeMounted;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot read cluster marker");
                return DataDirStatus::Unknown;
            }
        }

        let db_bytes = match std::fs::read(self.data_dir.join(DB_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return DataDirStatus::Corrupt;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot read database image");
                return DataDirStatus::Unknown;
            }
        };
        let image: DbImage = match bincode::deserialize(&db_bytes) {
            Ok(image) => image,
            Err(_) => return DataDirStatus::Corrupt,
        };

        if fail_below_revision > 0 && image.revision < fail_below_revision {
            tracing::warn!(
                revision = image.revision,
                floor = fail_below_revision,
                "on-disk revision is below the consistency floor"
            );
            return DataDirStatus::FailBelowRevisionConsistency;
        }

        DataDirStatus::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::embedded::EmbeddedKv;

    fn validator(data_dir: PathBuf, cluster_size: usize) -> DataValidator {
        DataValidator::new(
            data_dir,
            "alpha",
            cluster_size,
            Arc::new(MetricsRegistry::new()),
        )
    }

    fn healthy_dir(root: &std::path::Path) -> PathBuf {
        let dir = root.join("member-0");
        let kv = EmbeddedKv::open(&dir, "alpha", "m0").unwrap();
        kv.put(b"a", b"1");
        kv.close().unwrap();
        dir
    }

    #[test]
    fn test_valid_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = healthy_dir(root.path());
        assert_eq!(validator(dir, 1).validate(0), DataDirStatus::Valid);
    }

    #[test]
    fn test_missing_directory_is_corrupt() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("never-created");
        assert_eq!(validator(dir, 1).validate(0), DataDirStatus::Corrupt);
    }

    #[test]
    fn test_corrupt_database() {
        let root = tempfile::tempdir().unwrap();
        let dir = healthy_dir(root.path());
        std::fs::write(dir.join(DB_FILE), b"garbage").unwrap();
        assert_eq!(validator(dir, 1).validate(0), DataDirStatus::Corrupt);
    }

    #[test]
    fn test_lock_file_means_db_open_failure() {
        let root = tempfile::tempdir().unwrap();
        let dir = healthy_dir(root.path());
        std::fs::write(dir.join(LOCK_FILE), b"4242").unwrap();
        assert_eq!(validator(dir, 1).validate(0), DataDirStatus::FailToOpenDb);
    }

    #[test]
    fn test_foreign_cluster_marker() {
        let root = tempfile::tempdir().unwrap();
        let dir = healthy_dir(root.path());
        std::fs::write(dir.join(CLUSTER_MARKER_FILE), "other-cluster").unwrap();
        assert_eq!(
            validator(dir, 1).validate(0),
            DataDirStatus::WrongVolumeMounted
        );
    }

    #[test]
    fn test_revision_floor() {
        let root = tempfile::tempdir().unwrap();
        let dir = healthy_dir(root.path());
        assert_eq!(
            validator(dir.clone(), 1).validate(100),
            DataDirStatus::FailBelowRevisionConsistency
        );
        assert_eq!(validator(dir, 1).validate(1), DataDirStatus::Valid);
    }

    #[test]
    fn test_corrupt_in_multi_node() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("never-created");
        assert_eq!(
            validator(dir, 3).validate(0),
            DataDirStatus::InvalidInMultiNode
        );
    }
}
