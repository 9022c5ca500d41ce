//! KV client facade.
//!
//! The abstraction over the revisioned KV cluster that the rest of
//! the sidecar is written against. It exposes exactly the operations
//! the core needs: latest revision, a full database stream, a watch,
//! defragmentation, and the membership calls used by multi-node
//! initialization and leader election.
//!
//! [`embedded::EmbeddedKv`] is the in-process implementation used by
//! the restorer's replay target and by the test suites.

pub mod embedded;

use crate::core::error::TrellisResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Read;
use tokio::sync::mpsc;

/// A key-value record as carried in watch events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvRecord {
    /// The key (byte string).
    pub key: Vec<u8>,

    /// The value (byte string); empty for delete events.
    pub value: Vec<u8>,

    /// Revision when this key was created.
    pub create_revision: u64,

    /// Revision of this mutation.
    pub mod_revision: u64,

    /// Version counter, increments on each mutation of the key.
    pub version: u64,
}

/// Mutation type for watch events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

/// A single KV mutation observed on a watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// Mutation type.
    pub event_type: EventType,

    /// Current record for Put, last record state for Delete.
    pub kv: KvRecord,
}

/// A batch of mutations delivered by a watch, in revision order.
#[derive(Debug, Clone)]
pub struct WatchResponse {
    /// Events in this batch; never empty.
    pub events: Vec<WatchEvent>,
}

impl WatchResponse {
    /// Revision of the last event in the batch.
    pub fn last_revision(&self) -> u64 {
        self.events.last().map(|e| e.kv.mod_revision).unwrap_or(0)
    }
}

/// A watch event wrapped with its observation time, as serialized
/// into delta snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedEvent {
    /// The underlying KV event.
    pub event: WatchEvent,

    /// Wall-clock time the event was observed.
    pub time: DateTime<Utc>,
}

impl TimedEvent {
    /// Wrap an event with the current time.
    pub fn new(event: WatchEvent) -> Self {
        Self {
            event,
            time: Utc::now(),
        }
    }
}

/// Cancellable stream of watch responses.
///
/// Dropping the stream cancels the watch; the producer observes the
/// closed channel and stops.
pub struct WatchStream {
    rx: mpsc::Receiver<TrellisResult<WatchResponse>>,
}

impl WatchStream {
    /// Build a stream from its receiving half.
    pub fn new(rx: mpsc::Receiver<TrellisResult<WatchResponse>>) -> Self {
        Self { rx }
    }

    /// Receive the next batch.
    ///
    /// `None` means the producer closed the stream.
    pub async fn recv(&mut self) -> Option<TrellisResult<WatchResponse>> {
        self.rx.recv().await
    }
}

/// Member status as reported by the KV cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberStatus {
    /// This member currently leads the cluster.
    pub is_leader: bool,

    /// This member is a non-voting learner.
    pub is_learner: bool,
}

/// Abstract KV operations used by the sidecar core.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Highest committed revision.
    async fn latest_revision(&self) -> TrellisResult<u64>;

    /// Byte stream of the on-disk database image at roughly the
    /// current revision.
    ///
    /// The producer is not required to be atomic with
    /// [`Self::latest_revision`]; the stream may be slightly ahead.
    async fn snapshot_stream(&self) -> TrellisResult<Box<dyn Read + Send>>;

    /// Watch mutations with `mod_revision >= from_revision`, in
    /// monotonic revision order.
    async fn watch(&self, from_revision: u64) -> TrellisResult<WatchStream>;

    /// Compact the KV backend storage.
    async fn defragment(&self) -> TrellisResult<()>;

    /// Leader/learner status of the local member.
    async fn member_status(&self) -> TrellisResult<MemberStatus>;

    /// Member ids currently part of the cluster.
    async fn member_list(&self) -> TrellisResult<Vec<String>>;

    /// Add this member back as a non-voting learner.
    async fn add_learner(&self) -> TrellisResult<()>;

    /// Promote this member from learner to voting member.
    async fn promote_learner(&self) -> TrellisResult<()>;

    /// Remove this member from the cluster.
    async fn remove_member(&self) -> TrellisResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_response_last_revision() {
        let response = WatchResponse {
            events: vec![
                WatchEvent {
                    event_type: EventType::Put,
                    kv: KvRecord {
                        key: b"a".to_vec(),
                        value: b"1".to_vec(),
                        create_revision: 6,
                        mod_revision: 6,
                        version: 1,
                    },
                },
                WatchEvent {
                    event_type: EventType::Delete,
                    kv: KvRecord {
                        key: b"a".to_vec(),
                        value: Vec::new(),
                        create_revision: 6,
                        mod_revision: 7,
                        version: 0,
                    },
                },
            ],
        };
        assert_eq!(response.last_revision(), 7);
    }

    #[test]
    fn test_timed_event_json_shape() {
        let event = WatchEvent {
            event_type: EventType::Put,
            kv: KvRecord {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                create_revision: 1,
                mod_revision: 1,
                version: 1,
            },
        };
        let json = serde_json::to_string(&TimedEvent::new(event)).unwrap();
        assert!(json.contains("\"event\""));
        assert!(json.contains("\"time\""));
        assert!(json.contains("\"Put\""));
    }
}
