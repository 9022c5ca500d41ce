//! Error types and classification.
//!
//! Trellis distinguishes transient failures (retried on the next tick
//! of whichever loop observed them) from fatal ones (the event loop
//! exits and the caller restarts the process). Configuration errors
//! are always fatal at startup.

use thiserror::Error;

/// Common Trellis error conditions.
#[derive(Debug, Error)]
pub enum TrellisError {
    /// Requested snapshot object does not exist in the snap store.
    #[error("snapshot not found: {key}")]
    SnapshotNotFound { key: String },

    /// Transient snap store failure (network, throttling, 5xx).
    #[error("transient snap store failure: {message}")]
    TransientStore { message: String },

    /// Object key does not match the snapshot name grammar.
    #[error("invalid snapshot name: {name}")]
    InvalidSnapshotName { name: String },

    /// Compression suffix is not one of the recognised policies.
    #[error("unsupported compression suffix: {suffix:?}")]
    UnsupportedCompression { suffix: String },

    /// The KV store could not be reached or answered with an error.
    #[error("kv store unavailable: {message}")]
    KvUnavailable { message: String },

    /// Watch start revision lies below the KV compaction floor.
    #[error("watch revision {requested} has been compacted; floor is {floor}")]
    WatchCompacted { requested: u64, floor: u64 },

    /// Watch was cancelled locally.
    #[error("watch cancelled")]
    WatchCancelled,

    /// Trigger arrived while the snapshotter is not active.
    #[error("snapshotter is not active")]
    SnapshotterInactive,

    /// Delta trigger arrived while delta snapshotting is disabled.
    #[error("delta snapshot period {period_secs}s is below the 1s threshold; delta snapshotting is disabled")]
    DeltaSnapshottingDisabled { period_secs: u64 },

    /// Restore input failed an integrity check.
    ///
    /// Fatal to the current restore attempt; the data directory is
    /// left untouched.
    #[error("restore integrity violation: {message}")]
    RestoreIntegrity { message: String },

    /// Invalid configuration (bad cron expression, unknown provider,
    /// unreadable credentials).
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Internal invariant violation.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl TrellisError {
    /// Create a TransientStore error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientStore {
            message: message.into(),
        }
    }

    /// Create a KvUnavailable error.
    pub fn kv(message: impl Into<String>) -> Self {
        Self::KvUnavailable {
            message: message.into(),
        }
    }

    /// Create a RestoreIntegrity error.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::RestoreIntegrity {
            message: message.into(),
        }
    }

    /// Create a Configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the operation that produced this error should be
    /// retried on the next loop tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientStore { .. } | Self::KvUnavailable { .. }
        )
    }

    /// Check if this error must terminate the process at startup.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

impl From<std::io::Error> for TrellisError {
    fn from(err: std::io::Error) -> Self {
        Self::TransientStore {
            message: err.to_string(),
        }
    }
}

/// Result type using TrellisError.
pub type TrellisResult<T> = Result<T, TrellisError>;
