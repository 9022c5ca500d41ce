//! Trellis - continuous backup and disaster recovery sidecar for
//! revisioned key-value stores.
//!
//! Trellis co-resides with a single member of a revisioned, MVCC,
//! watch-capable KV store and keeps it recoverable: it streams
//! periodic full snapshots and the mutations between them as delta
//! snapshots to a pluggable object store, prunes old snapshot chains
//! under a retention policy, and rebuilds a damaged data directory
//! from the latest chain at startup. In a multi-member cluster,
//! leader election makes exactly one sidecar drive snapshotting.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      KV Client Facade                       │
//! │    latest revision │ snapshot stream │ watch │ membership   │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Snapshotter                          │
//! │   cron fulls │ periodic deltas │ event buffer │ triggers    │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Compressor                           │
//! │                  gzip │ lz4 │ zlib │ none                   │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Snap Store                           │
//! │   S3 │ ABS │ GCS │ Swift │ OSS │ OCS │ ECS │ Local │ Fake   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Steady state flows top to bottom; the garbage collector prunes
//! the snap store on its own period. At startup the validator and
//! restorer run first, and the leader elector gates whether the
//! snapshotter is active on this instance.
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Error types and classification
//! - [`core::schedule`] - Cron schedules for full snapshots
//! - [`core::runtime`] - Component lifecycle orchestration
//!
//! ## Snapshotting
//! - [`snapshot::types`] - Snapshot descriptors and name grammar
//! - [`snapshot::snapshotter`] - Full/delta scheduler and collector
//! - [`snapshot::gc`] - Retention pruning
//! - [`snapshot::restorer`] - Chain replay into a data directory
//!
//! ## Storage
//! - [`snapstore`] - Provider-agnostic snapshot object store
//! - [`compress`] - Streaming (de)compression
//!
//! ## KV
//! - [`kv`] - KV client facade
//! - [`kv::embedded`] - In-process revisioned KV store
//!
//! ## Cluster
//! - [`cluster::leader`] - Leader election among sidecars
//! - [`cluster::member`] - Membership control with retries
//!
//! ## Initialization
//! - [`init::validator`] - Data directory sanity checks
//! - [`init::initializer`] - Validate-or-restore startup flow
//!
//! ## Operations
//! - [`ops::observability`] - In-process metrics registry
//!
//! # Key Invariants
//!
//! - **CHAIN-CONTIGUOUS**: within a generation, each delta starts at
//!   its predecessor's last revision plus one
//! - **REV-MONOTONE**: snapshots sorted by revision are strictly
//!   increasing; the watch delivers events in revision order
//! - **ONE-IN-FLIGHT**: a snapshotter never overlaps two store writes
//! - **FINAL-CLOSES**: a final full snapshot terminates its
//!   generation; no deltas append to it

// Core infrastructure
pub mod core;

// Snapshot pipeline
pub mod snapshot;

// Object storage
pub mod snapstore;

// Compression
pub mod compress;

// KV client facade
pub mod kv;

// Cluster coordination
pub mod cluster;

// Startup initialization
pub mod init;

// Operations and observability
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime, schedule};
pub use cluster::{leader, member};
pub use init::{initializer, validator};
pub use ops::observability;
pub use snapshot::{gc, restorer, snapshotter, types};
