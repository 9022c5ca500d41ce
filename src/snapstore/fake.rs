//! In-memory snap store used by tests and local dry runs.
//!
//! Satisfies the same ordering and versioning contract as the cloud
//! providers: objects carry versions and tags, listing returns only
//! the latest non-excluded version of each key, and an optional
//! object-lock retention window makes deletion fail while an object
//! is still protected.

use super::{snapshots_from_keys, SnapStore, DEFAULT_CHUNK_SIZE};
use crate::core::error::{TrellisError, TrellisResult};
use crate::snapshot::types::{Snapshot, EXCLUDE_TAG_KEY};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};

#[derive(Debug, Clone)]
struct ObjectVersion {
    data: Vec<u8>,
    tags: HashMap<String, String>,
    uploaded_at: DateTime<Utc>,
}

/// In-memory versioned object store.
pub struct FakeSnapStore {
    prefix: String,
    objects: Mutex<BTreeMap<String, Vec<ObjectVersion>>>,
    retention_period: Mutex<Option<Duration>>,
    chunk_threshold: usize,
    fail_next_saves: Mutex<u32>,
}

impl FakeSnapStore {
    /// Create an empty fake store.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            retention_period: Mutex::new(None),
            chunk_threshold: DEFAULT_CHUNK_SIZE,
            fail_next_saves: Mutex::new(0),
        }
    }

    /// Enable object-lock simulation with the given retention period.
    pub fn set_retention_period(&self, period: Duration) {
        *self.retention_period.lock() = Some(period);
    }

    /// Tag the latest version of a snapshot's object.
    pub fn tag_object(&self, snap: &Snapshot, key: &str, value: &str) {
        let full_key = self.full_key(snap);
        if let Some(versions) = self.objects.lock().get_mut(&full_key) {
            if let Some(latest) = versions.last_mut() {
                latest.tags.insert(key.to_string(), value.to_string());
            }
        }
    }

    /// Hide a snapshot from chain discovery via the exclude tag.
    pub fn exclude_object(&self, snap: &Snapshot) {
        self.tag_object(snap, EXCLUDE_TAG_KEY, "true");
    }

    /// Make the next `n` save calls fail with a transient error.
    pub fn fail_next_saves(&self, n: u32) {
        *self.fail_next_saves.lock() = n;
    }

    /// Number of stored objects, chunk artifacts included.
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Raw bytes of the latest version of a snapshot's object.
    pub fn raw_object(&self, snap: &Snapshot) -> Option<Vec<u8>> {
        let full_key = self.full_key(snap);
        self.objects
            .lock()
            .get(&full_key)
            .and_then(|versions| versions.last())
            .map(|v| v.data.clone())
    }

    /// Overwrite the latest version of a snapshot's object.
    ///
    /// Test hook for corrupting stored payloads.
    pub fn overwrite_object(&self, snap: &Snapshot, data: Vec<u8>) {
        let full_key = self.full_key(snap);
        if let Some(versions) = self.objects.lock().get_mut(&full_key) {
            if let Some(latest) = versions.last_mut() {
                latest.data = data;
            }
        }
    }

    fn full_key(&self, snap: &Snapshot) -> String {
        if self.prefix.is_empty() {
            snap.key()
        } else {
            format!("{}/{}", self.prefix, snap.key())
        }
    }

    fn relative_key<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix)
                .map(|k| k.trim_start_matches('/'))
                .unwrap_or(key)
        }
    }

    fn within_retention(&self, version: &ObjectVersion) -> bool {
        match *self.retention_period.lock() {
            Some(period) => version.uploaded_at + period > Utc::now(),
            None => false,
        }
    }
}

#[async_trait]
impl SnapStore for FakeSnapStore {
    async fn fetch(&self, snap: &Snapshot) -> TrellisResult<Box<dyn Read + Send>> {
        let key = self.full_key(snap);
        let objects = self.objects.lock();
        let version = objects
            .get(&key)
            .and_then(|versions| versions.last())
            .ok_or(TrellisError::SnapshotNotFound { key: key.clone() })?;
        Ok(Box::new(Cursor::new(version.data.clone())))
    }

    async fn save(&self, snap: &Snapshot, mut reader: Box<dyn Read + Send>) -> TrellisResult<()> {
        {
            let mut failures = self.fail_next_saves.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(TrellisError::transient("injected save failure"));
            }
        }

        // Consume in chunk-threshold pieces so a large stream takes
        // the same staged path a multipart upload would; nothing is
        // visible until the assembled object is inserted.
        let mut staged: Vec<Vec<u8>> = Vec::new();
        loop {
            let mut chunk = vec![0u8; self.chunk_threshold];
            let mut filled = 0;
            while filled < chunk.len() {
                let n = reader
                    .read(&mut chunk[filled..])
                    .map_err(|e| TrellisError::transient(format!("read upload stream: {e}")))?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            chunk.truncate(filled);
            let done = filled < self.chunk_threshold;
            if !chunk.is_empty() || staged.is_empty() {
                staged.push(chunk);
            }
            if done {
                break;
            }
        }

        let mut data = Vec::new();
        for chunk in staged {
            data.extend_from_slice(&chunk);
        }

        let key = self.full_key(snap);
        self.objects
            .lock()
            .entry(key)
            .or_default()
            .push(ObjectVersion {
                data,
                tags: HashMap::new(),
                uploaded_at: Utc::now(),
            });
        Ok(())
    }

    async fn list(&self) -> TrellisResult<Vec<Snapshot>> {
        let objects = self.objects.lock();
        let visible: Vec<&str> = objects
            .iter()
            .filter(|(_, versions)| {
                versions
                    .last()
                    .map(|v| v.tags.get(EXCLUDE_TAG_KEY).map(String::as_str) != Some("true"))
                    .unwrap_or(false)
            })
            .map(|(key, _)| self.relative_key(key))
            .collect();
        Ok(snapshots_from_keys(visible.into_iter()))
    }

    async fn delete(&self, snap: &Snapshot) -> TrellisResult<()> {
        let key = self.full_key(snap);
        let mut objects = self.objects.lock();
        let Some(versions) = objects.get(&key) else {
            return Err(TrellisError::SnapshotNotFound { key });
        };
        if let Some(latest) = versions.last() {
            if self.within_retention(latest) {
                return Err(TrellisError::transient(format!(
                    "object {key} is locked by its retention window"
                )));
            }
        }
        objects.remove(&key);
        Ok(())
    }

    async fn size(&self, snap: &Snapshot) -> TrellisResult<i64> {
        let key = self.full_key(snap);
        let objects = self.objects.lock();
        let version = objects
            .get(&key)
            .and_then(|versions| versions.last())
            .ok_or(TrellisError::SnapshotNotFound { key: key.clone() })?;
        Ok(version.data.len() as i64)
    }

    fn retention_period(&self) -> Option<Duration> {
        *self.retention_period.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::types::SnapshotKind;

    fn snap(kind: SnapshotKind, start: u64, last: u64) -> Snapshot {
        Snapshot::new(kind, start, last, "", false)
    }

    #[tokio::test]
    async fn test_save_fetch_round_trip() {
        let store = FakeSnapStore::new("backups");
        let s = snap(SnapshotKind::Full, 0, 10);
        store
            .save(&s, Box::new(Cursor::new(b"payload".to_vec())))
            .await
            .unwrap();

        let mut out = Vec::new();
        store.fetch(&s).await.unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"payload");
        assert_eq!(store.size(&s).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_fetch_missing_is_not_found() {
        let store = FakeSnapStore::new("");
        match store.fetch(&snap(SnapshotKind::Full, 0, 1)).await {
            Err(err) => assert!(matches!(err, TrellisError::SnapshotNotFound { .. })),
            Ok(_) => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn test_list_sorted_and_filtered() {
        let store = FakeSnapStore::new("");
        let full = snap(SnapshotKind::Full, 0, 10);
        let delta = snap(SnapshotKind::Delta, 11, 20);
        store
            .save(&delta, Box::new(Cursor::new(b"d".to_vec())))
            .await
            .unwrap();
        store
            .save(&full, Box::new(Cursor::new(b"f".to_vec())))
            .await
            .unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].kind, SnapshotKind::Full);
        assert_eq!(listed[1].kind, SnapshotKind::Delta);
    }

    #[tokio::test]
    async fn test_excluded_versions_hidden() {
        let store = FakeSnapStore::new("");
        let full = snap(SnapshotKind::Full, 0, 10);
        store
            .save(&full, Box::new(Cursor::new(b"f".to_vec())))
            .await
            .unwrap();
        store.exclude_object(&full);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retention_blocks_delete() {
        let store = FakeSnapStore::new("");
        store.set_retention_period(Duration::hours(1));
        let full = snap(SnapshotKind::Full, 0, 10);
        store
            .save(&full, Box::new(Cursor::new(b"f".to_vec())))
            .await
            .unwrap();

        let err = store.delete(&full).await.unwrap_err();
        assert!(matches!(err, TrellisError::TransientStore { .. }));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_save_failure_leaves_no_object() {
        let store = FakeSnapStore::new("");
        store.fail_next_saves(1);
        let full = snap(SnapshotKind::Full, 0, 10);
        let err = store
            .save(&full, Box::new(Cursor::new(b"f".to_vec())))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.object_count(), 0);

        store
            .save(&full, Box::new(Cursor::new(b"f".to_vec())))
            .await
            .unwrap();
        assert_eq!(store.object_count(), 1);
    }
}
