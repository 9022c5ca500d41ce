//! In-process revisioned KV store.
//!
//! `EmbeddedKv` implements the [`KvClient`] facade against an
//! in-memory MVCC index with a persisted database image. The restorer
//! boots one against a fresh `<data_dir>.part` to replay delta
//! events, and the test suites drive the snapshotter against one.
//!
//! # Data directory layout
//!
//! - `db` - bincode-encoded [`DbImage`]
//! - `LOCK` - present while a process holds the directory
//! - `cluster` - cluster name marker, checked by the validator

use super::{EventType, KvClient, KvRecord, MemberStatus, TimedEvent, WatchEvent, WatchResponse,
            WatchStream};
use crate::core::error::{TrellisError, TrellisResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Database image file inside the data directory.
pub const DB_FILE: &str = "db";
/// Lock file taken while a process holds the data directory.
pub const LOCK_FILE: &str = "LOCK";
/// Cluster name marker file.
pub const CLUSTER_MARKER_FILE: &str = "cluster";

const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Serialized database image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbImage {
    /// Highest committed revision.
    pub revision: u64,

    /// History below this revision has been discarded.
    pub compaction_floor: u64,

    /// Live records.
    pub records: Vec<KvRecord>,

    /// Mutation history retained for watch replay.
    pub history: Vec<WatchEvent>,
}

struct KvCore {
    revision: u64,
    compaction_floor: u64,
    index: BTreeMap<Vec<u8>, KvRecord>,
    history: Vec<WatchEvent>,
    watchers: Vec<mpsc::Sender<TrellisResult<WatchResponse>>>,
    is_leader: bool,
    is_learner: bool,
    member_id: String,
    members: Vec<String>,
    fail_add_learner: u32,
    data_dir: Option<PathBuf>,
}

impl KvCore {
    fn new(member_id: &str) -> Self {
        Self {
            revision: 0,
            compaction_floor: 0,
            index: BTreeMap::new(),
            history: Vec::new(),
            watchers: Vec::new(),
            is_leader: true,
            is_learner: false,
            member_id: member_id.to_string(),
            members: vec![member_id.to_string()],
            fail_add_learner: 0,
            data_dir: None,
        }
    }

    fn image(&self) -> DbImage {
        DbImage {
            revision: self.revision,
            compaction_floor: self.compaction_floor,
            records: self.index.values().cloned().collect(),
            history: self.history.clone(),
        }
    }

    fn load_image(&mut self, image: DbImage) {
        self.revision = image.revision;
        self.compaction_floor = image.compaction_floor;
        self.index = image
            .records
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();
        self.history = image.history;
    }

    fn notify(&mut self, event: WatchEvent) {
        self.history.push(event.clone());
        self.watchers.retain(|tx| {
            tx.try_send(Ok(WatchResponse {
                events: vec![event.clone()],
            }))
            .is_ok()
        });
    }
}

/// In-process KV store implementing the client facade.
#[derive(Clone)]
pub struct EmbeddedKv {
    core: Arc<Mutex<KvCore>>,
}

impl EmbeddedKv {
    /// Create an empty store not bound to a data directory.
    pub fn new(member_id: &str) -> Self {
        Self {
            core: Arc::new(Mutex::new(KvCore::new(member_id))),
        }
    }

    /// Open (or create) a store over the given data directory.
    ///
    /// Takes the directory lock and writes the cluster marker; fails
    /// if another process already holds the lock.
    pub fn open(data_dir: &Path, cluster_name: &str, member_id: &str) -> TrellisResult<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| TrellisError::internal(format!("create data dir: {e}")))?;

        let lock_path = data_dir.join(LOCK_FILE);
        if lock_path.exists() {
            return Err(TrellisError::internal(format!(
                "data directory {} is locked by another process",
                data_dir.display()
            )));
        }
        std::fs::write(&lock_path, std::process::id().to_string())
            .map_err(|e| TrellisError::internal(format!("take data dir lock: {e}")))?;
        std::fs::write(data_dir.join(CLUSTER_MARKER_FILE), cluster_name)
            .map_err(|e| TrellisError::internal(format!("write cluster marker: {e}")))?;

        let kv = Self::new(member_id);
        {
            let mut core = kv.core.lock();
            core.data_dir = Some(data_dir.to_path_buf());
            let db_path = data_dir.join(DB_FILE);
            if db_path.exists() {
                let bytes = std::fs::read(&db_path)
                    .map_err(|e| TrellisError::internal(format!("read db image: {e}")))?;
                let image: DbImage = bincode::deserialize(&bytes).map_err(|e| {
                    TrellisError::internal(format!("decode db image: {e}"))
                })?;
                core.load_image(image);
            }
        }
        Ok(kv)
    }

    /// Bind an unbound store to a data directory.
    ///
    /// Used after initialization has validated or restored the
    /// directory: takes the lock, writes the marker, and loads any
    /// existing database image.
    pub fn bind_data_dir(&self, data_dir: &Path, cluster_name: &str) -> TrellisResult<()> {
        let member_id = self.core.lock().member_id.clone();
        let bound = Self::open(data_dir, cluster_name, &member_id)?;
        let image = bound.core.lock().image();
        let mut core = self.core.lock();
        core.load_image(image);
        core.data_dir = Some(data_dir.to_path_buf());
        // The lock taken by the probe instance now belongs to us.
        bound.core.lock().data_dir = None;
        Ok(())
    }

    /// Load the records of a database image produced by
    /// [`KvClient::snapshot_stream`]. Returns the image size in
    /// bytes.
    pub fn restore_image(&self, mut reader: Box<dyn Read + Send>) -> TrellisResult<usize> {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| TrellisError::integrity(format!("read database image: {e}")))?;
        let image: DbImage = bincode::deserialize(&bytes)
            .map_err(|e| TrellisError::integrity(format!("decode database image: {e}")))?;
        self.core.lock().load_image(image);
        Ok(bytes.len())
    }

    /// Write the database image to the bound data directory.
    pub fn persist(&self) -> TrellisResult<()> {
        let core = self.core.lock();
        let Some(dir) = core.data_dir.clone() else {
            return Err(TrellisError::internal(
                "embedded kv is not bound to a data directory",
            ));
        };
        let bytes = bincode::serialize(&core.image())
            .map_err(|e| TrellisError::internal(format!("encode db image: {e}")))?;
        std::fs::write(dir.join(DB_FILE), bytes)
            .map_err(|e| TrellisError::internal(format!("write db image: {e}")))?;
        Ok(())
    }

    /// Persist and release the directory lock.
    pub fn close(&self) -> TrellisResult<()> {
        self.persist()?;
        let mut core = self.core.lock();
        if let Some(dir) = core.data_dir.take() {
            let _ = std::fs::remove_file(dir.join(LOCK_FILE));
        }
        Ok(())
    }

    /// Put a key, returning the new revision.
    pub fn put(&self, key: &[u8], value: &[u8]) -> u64 {
        let mut core = self.core.lock();
        core.revision += 1;
        let revision = core.revision;
        let record = match core.index.get(key) {
            Some(existing) => KvRecord {
                key: key.to_vec(),
                value: value.to_vec(),
                create_revision: existing.create_revision,
                mod_revision: revision,
                version: existing.version + 1,
            },
            None => KvRecord {
                key: key.to_vec(),
                value: value.to_vec(),
                create_revision: revision,
                mod_revision: revision,
                version: 1,
            },
        };
        core.index.insert(key.to_vec(), record.clone());
        core.notify(WatchEvent {
            event_type: EventType::Put,
            kv: record,
        });
        revision
    }

    /// Delete a key, returning the new revision if the key existed.
    pub fn delete(&self, key: &[u8]) -> Option<u64> {
        let mut core = self.core.lock();
        let existing = core.index.remove(key)?;
        core.revision += 1;
        let revision = core.revision;
        core.notify(WatchEvent {
            event_type: EventType::Delete,
            kv: KvRecord {
                key: existing.key,
                value: Vec::new(),
                create_revision: existing.create_revision,
                mod_revision: revision,
                version: 0,
            },
        });
        Some(revision)
    }

    /// Apply a previously observed event, preserving its revisions.
    ///
    /// This is the restorer's replay path: the event's
    /// `mod_revision` becomes the store revision.
    pub fn apply_event(&self, timed: &TimedEvent) -> TrellisResult<()> {
        let mut core = self.core.lock();
        let event = &timed.event;
        let revision = event.kv.mod_revision;
        if revision <= core.revision {
            return Err(TrellisError::integrity(format!(
                "event revision {revision} is not above store revision {}",
                core.revision
            )));
        }
        match event.event_type {
            EventType::Put => {
                core.index.insert(event.kv.key.clone(), event.kv.clone());
            }
            EventType::Delete => {
                core.index.remove(&event.kv.key);
            }
        }
        core.revision = revision;
        core.history.push(event.clone());
        Ok(())
    }

    /// Discard watch history below `revision`.
    pub fn compact(&self, revision: u64) {
        let mut core = self.core.lock();
        core.compaction_floor = revision.min(core.revision);
        let floor = core.compaction_floor;
        core.history.retain(|e| e.kv.mod_revision >= floor);
    }

    /// Current record for a key.
    pub fn get(&self, key: &[u8]) -> Option<KvRecord> {
        self.core.lock().index.get(key).cloned()
    }

    /// All live records in key order.
    pub fn records(&self) -> Vec<KvRecord> {
        self.core.lock().index.values().cloned().collect()
    }

    /// Mark this member as leader or follower.
    pub fn set_leader(&self, is_leader: bool) {
        self.core.lock().is_leader = is_leader;
    }

    /// Mark this member as learner or voting member.
    pub fn set_learner(&self, is_learner: bool) {
        self.core.lock().is_learner = is_learner;
    }

    /// Make the next `n` add-learner calls fail.
    pub fn fail_next_add_learner(&self, n: u32) {
        self.core.lock().fail_add_learner = n;
    }
}

#[async_trait]
impl KvClient for EmbeddedKv {
    async fn latest_revision(&self) -> TrellisResult<u64> {
        Ok(self.core.lock().revision)
    }

    async fn snapshot_stream(&self) -> TrellisResult<Box<dyn Read + Send>> {
        let image = self.core.lock().image();
        let bytes = bincode::serialize(&image)
            .map_err(|e| TrellisError::internal(format!("encode db image: {e}")))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn watch(&self, from_revision: u64) -> TrellisResult<WatchStream> {
        let mut core = self.core.lock();
        if core.compaction_floor > 0 && from_revision < core.compaction_floor {
            return Err(TrellisError::WatchCompacted {
                requested: from_revision,
                floor: core.compaction_floor,
            });
        }

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let backlog: Vec<WatchEvent> = core
            .history
            .iter()
            .filter(|e| e.kv.mod_revision >= from_revision)
            .cloned()
            .collect();
        if !backlog.is_empty() {
            let _ = tx.try_send(Ok(WatchResponse { events: backlog }));
        }
        core.watchers.push(tx);
        Ok(WatchStream::new(rx))
    }

    async fn defragment(&self) -> TrellisResult<()> {
        // The in-process backend has nothing to compact on disk
        // beyond rewriting its image.
        let core = self.core.lock();
        if core.data_dir.is_some() {
            drop(core);
            self.persist()?;
        }
        Ok(())
    }

    async fn member_status(&self) -> TrellisResult<MemberStatus> {
        let core = self.core.lock();
        Ok(MemberStatus {
            is_leader: core.is_leader,
            is_learner: core.is_learner,
        })
    }

    async fn member_list(&self) -> TrellisResult<Vec<String>> {
        Ok(self.core.lock().members.clone())
    }

    async fn add_learner(&self) -> TrellisResult<()> {
        let mut core = self.core.lock();
        if core.fail_add_learner > 0 {
            core.fail_add_learner -= 1;
            return Err(TrellisError::kv("add learner refused"));
        }
        let member_id = core.member_id.clone();
        if !core.members.contains(&member_id) {
            core.members.push(member_id);
        }
        core.is_learner = true;
        Ok(())
    }

    async fn promote_learner(&self) -> TrellisResult<()> {
        self.core.lock().is_learner = false;
        Ok(())
    }

    async fn remove_member(&self) -> TrellisResult<()> {
        let mut core = self.core.lock();
        let member_id = core.member_id.clone();
        core.members.retain(|m| m != &member_id);
        Ok(())
    }
}
