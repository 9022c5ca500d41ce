//! Filesystem snap store.
//!
//! Objects live under `<root>/<prefix>/<snap_dir>/<snap_name>`.
//! Uploads stage into a hidden scratch directory and move into place
//! with a rename, so a failed upload never leaves a visible object.

use super::{snapshots_from_keys, SnapStore};
use crate::core::error::{TrellisError, TrellisResult};
use crate::snapshot::types::{Snapshot, SNAP_DIR_V1, SNAP_DIR_V2};
use async_trait::async_trait;
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;

const STAGING_DIR: &str = ".upload";

/// Snap store backed by a local directory.
pub struct LocalSnapStore {
    root: PathBuf,
}

impl LocalSnapStore {
    /// Create the store, ensuring the root directory exists.
    pub fn new(container: PathBuf, prefix: &str) -> TrellisResult<Self> {
        let root = if prefix.is_empty() {
            container
        } else {
            container.join(prefix)
        };
        fs::create_dir_all(&root).map_err(|e| {
            TrellisError::configuration(format!(
                "cannot create snap store root {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    fn object_path(&self, snap: &Snapshot) -> PathBuf {
        self.root.join(&snap.snap_dir).join(&snap.snap_name)
    }
}

#[async_trait]
impl SnapStore for LocalSnapStore {
    async fn fetch(&self, snap: &Snapshot) -> TrellisResult<Box<dyn Read + Send>> {
        let path = self.object_path(snap);
        let file = fs::File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TrellisError::SnapshotNotFound { key: snap.key() }
            } else {
                TrellisError::transient(format!("open {}: {e}", path.display()))
            }
        })?;
        Ok(Box::new(file))
    }

    async fn save(&self, snap: &Snapshot, mut reader: Box<dyn Read + Send>) -> TrellisResult<()> {
        let staging_dir = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging_dir)
            .map_err(|e| TrellisError::transient(format!("create staging dir: {e}")))?;
        let staging_path = staging_dir.join(&snap.snap_name);

        let result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&staging_path)?;
            let mut chunk = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                file.write_all(&chunk[..n])?;
            }
            file.sync_all()
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&staging_path);
            return Err(TrellisError::transient(format!("stage upload: {e}")));
        }

        let final_path = self.object_path(snap);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| TrellisError::transient(format!("create object dir: {e}")))?;
        }
        fs::rename(&staging_path, &final_path).map_err(|e| {
            let _ = fs::remove_file(&staging_path);
            TrellisError::transient(format!("publish object {}: {e}", final_path.display()))
        })?;
        Ok(())
    }

    async fn list(&self) -> TrellisResult<Vec<Snapshot>> {
        let mut keys = Vec::new();
        for dir in [SNAP_DIR_V1, SNAP_DIR_V2] {
            let dir_path = self.root.join(dir);
            let entries = match fs::read_dir(&dir_path) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(TrellisError::transient(format!(
                        "list {}: {e}",
                        dir_path.display()
                    )))
                }
            };
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    keys.push(format!("{dir}/{}", entry.file_name().to_string_lossy()));
                }
            }
        }
        Ok(snapshots_from_keys(keys.iter().map(String::as_str)))
    }

    async fn delete(&self, snap: &Snapshot) -> TrellisResult<()> {
        let path = self.object_path(snap);
        fs::remove_file(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TrellisError::SnapshotNotFound { key: snap.key() }
            } else {
                TrellisError::transient(format!("delete {}: {e}", path.display()))
            }
        })
    }

    async fn size(&self, snap: &Snapshot) -> TrellisResult<i64> {
        let path = self.object_path(snap);
        let metadata = fs::metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TrellisError::SnapshotNotFound { key: snap.key() }
            } else {
                TrellisError::transient(format!("stat {}: {e}", path.display()))
            }
        })?;
        Ok(metadata.len() as i64)
    }
}
