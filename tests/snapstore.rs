//! Snap store contract and garbage collection tests.
//!
//! Listing order, chain discovery, version exclusion, retention
//! policies and object-lock behaviour, all against the fake and
//! local providers.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use trellis::gc::{GarbageCollectionPolicy, GarbageCollector};
use trellis::observability::MetricsRegistry;
use trellis::snapstore::fake::FakeSnapStore;
use trellis::snapstore::local::LocalSnapStore;
use trellis::snapstore::{
    latest_full_and_deltas, snapstore_secret_modified_time, SnapStore,
};
use trellis::types::{sort_snapshots, Snapshot, SnapshotKind};

async fn put(store: &dyn SnapStore, snap: &Snapshot) {
    store
        .save(snap, Box::new(Cursor::new(b"payload".to_vec())))
        .await
        .unwrap();
}

fn aged(kind: SnapshotKind, start: u64, last: u64, age: ChronoDuration) -> Snapshot {
    Snapshot::new_at(kind, start, last, "", false, Utc::now() - age)
}

#[tokio::test]
async fn test_list_order_across_generations() {
    let store = FakeSnapStore::new("");
    let full_a = Snapshot::new(SnapshotKind::Full, 0, 10, "", false);
    let delta_a1 = Snapshot::new(SnapshotKind::Delta, 11, 15, "", false);
    let delta_a2 = Snapshot::new(SnapshotKind::Delta, 16, 30, "", false);
    let full_b = Snapshot::new(SnapshotKind::Full, 0, 30, "", false);

    for snap in [&delta_a2, &full_b, &full_a, &delta_a1] {
        put(&store, snap).await;
    }

    let listed = store.list().await.unwrap();
    let keys: Vec<String> = listed.iter().map(|s| s.key()).collect();
    let mut expected = vec![
        full_a.clone(),
        full_b.clone(),
        delta_a1.clone(),
        delta_a2.clone(),
    ];
    sort_snapshots(&mut expected);
    assert_eq!(
        keys,
        expected.iter().map(|s| s.key()).collect::<Vec<String>>()
    );

    // Fulls sort before deltas sharing their revision range.
    assert_eq!(listed[0].kind, SnapshotKind::Full);
}

#[tokio::test]
async fn test_chain_discovery_picks_latest_full() {
    let store = FakeSnapStore::new("");
    put(&store, &aged(SnapshotKind::Full, 0, 10, ChronoDuration::hours(3))).await;
    put(
        &store,
        &aged(SnapshotKind::Delta, 11, 20, ChronoDuration::hours(2)),
    )
    .await;
    put(&store, &aged(SnapshotKind::Full, 0, 20, ChronoDuration::hours(1))).await;
    put(
        &store,
        &aged(SnapshotKind::Delta, 21, 25, ChronoDuration::minutes(30)),
    )
    .await;
    put(
        &store,
        &aged(SnapshotKind::Delta, 26, 40, ChronoDuration::minutes(10)),
    )
    .await;

    let (full, deltas) = latest_full_and_deltas(&store).await.unwrap();
    let full = full.unwrap();
    assert_eq!(full.last_revision, 20);
    assert_eq!(deltas.len(), 2);
    assert_eq!(deltas[0].start_revision, 21);
    assert_eq!(deltas[1].last_revision, 40);
}

#[tokio::test]
async fn test_chain_discovery_excluded_objects_hidden() {
    let store = FakeSnapStore::new("");
    let old_full = aged(SnapshotKind::Full, 0, 10, ChronoDuration::hours(2));
    let new_full = aged(SnapshotKind::Full, 0, 20, ChronoDuration::hours(1));
    put(&store, &old_full).await;
    put(&store, &new_full).await;

    store.exclude_object(&new_full);

    let (full, _) = latest_full_and_deltas(&store).await.unwrap();
    assert_eq!(full.unwrap().last_revision, 10);
}

#[tokio::test]
async fn test_chain_discovery_empty_store() {
    let store = FakeSnapStore::new("");
    let (full, deltas) = latest_full_and_deltas(&store).await.unwrap();
    assert!(full.is_none());
    assert!(deltas.is_empty());
}

#[tokio::test]
async fn test_local_store_matches_fake_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalSnapStore::new(dir.path().to_path_buf(), "backups").unwrap();

    let full = Snapshot::new(SnapshotKind::Full, 0, 5, ".gz", false);
    let delta = Snapshot::new(SnapshotKind::Delta, 6, 9, ".gz", false);
    put(&store, &full).await;
    put(&store, &delta).await;

    let listed = store.list().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].kind, SnapshotKind::Full);
    assert_eq!(listed[1].compression_suffix, ".gz");

    let (base, deltas) = latest_full_and_deltas(&store).await.unwrap();
    assert_eq!(base.unwrap().last_revision, 5);
    assert_eq!(deltas.len(), 1);
}

fn collector(
    store: Arc<FakeSnapStore>,
    policy: GarbageCollectionPolicy,
    max_backups: usize,
) -> GarbageCollector {
    GarbageCollector::new(
        store,
        policy,
        Duration::from_secs(60),
        max_backups,
        Arc::new(MetricsRegistry::new()),
    )
}

#[tokio::test]
async fn test_gc_limit_based_keeps_recent_chains() {
    let store = Arc::new(FakeSnapStore::new(""));
    // Three generations, oldest first.
    put(
        store.as_ref(),
        &aged(SnapshotKind::Full, 0, 10, ChronoDuration::hours(30)),
    )
    .await;
    put(
        store.as_ref(),
        &aged(SnapshotKind::Delta, 11, 20, ChronoDuration::hours(29)),
    )
    .await;
    put(
        store.as_ref(),
        &aged(SnapshotKind::Full, 0, 20, ChronoDuration::hours(20)),
    )
    .await;
    put(
        store.as_ref(),
        &aged(SnapshotKind::Delta, 21, 30, ChronoDuration::hours(19)),
    )
    .await;
    put(
        store.as_ref(),
        &aged(SnapshotKind::Full, 0, 30, ChronoDuration::hours(10)),
    )
    .await;

    let gc = collector(Arc::clone(&store), GarbageCollectionPolicy::LimitBased, 2);
    let deleted = gc.collect(Utc::now()).await.unwrap();
    assert_eq!(deleted, 2);

    let remaining = store.list().await.unwrap();
    let fulls: Vec<&Snapshot> = remaining
        .iter()
        .filter(|s| s.kind == SnapshotKind::Full)
        .collect();
    assert_eq!(fulls.len(), 2);
    assert_eq!(fulls[0].last_revision, 20);

    assert_valid_chains(&remaining);
}

#[tokio::test]
async fn test_gc_exponential_keeps_last_hour_and_hourlies() {
    use chrono::TimeZone;

    let store = Arc::new(FakeSnapStore::new(""));
    let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
    let at = |h: u32, m: u32| Utc.with_ymd_and_hms(2024, 3, 10, h, m, 0).unwrap();

    let old_a = Snapshot::new_at(SnapshotKind::Full, 0, 10, "", false, at(8, 50));
    let old_b = Snapshot::new_at(SnapshotKind::Full, 0, 20, "", false, at(8, 55));
    // Everything within the last hour is untouchable.
    let recent_full = Snapshot::new_at(SnapshotKind::Full, 0, 30, "", false, at(11, 30));
    let recent_delta = Snapshot::new_at(SnapshotKind::Delta, 31, 40, "", false, at(11, 50));

    // Two fulls in the same past hour bucket: only the most recent
    // survives.
    for snap in [&old_a, &old_b, &recent_full, &recent_delta] {
        put(store.as_ref(), snap).await;
    }

    let gc = collector(Arc::clone(&store), GarbageCollectionPolicy::Exponential, 0);
    gc.collect(now).await.unwrap();

    let remaining = store.list().await.unwrap();
    let fulls: Vec<u64> = remaining
        .iter()
        .filter(|s| s.kind == SnapshotKind::Full)
        .map(|s| s.last_revision)
        .collect();
    assert!(!fulls.contains(&10), "older full in the bucket must go");
    assert!(fulls.contains(&20));
    assert!(fulls.contains(&30));
    assert!(remaining.iter().any(|s| s.kind == SnapshotKind::Delta));

    assert_valid_chains(&remaining);
}

#[tokio::test]
async fn test_gc_skips_objects_within_retention_window() {
    let store = Arc::new(FakeSnapStore::new(""));
    store.set_retention_period(ChronoDuration::hours(48));

    put(
        store.as_ref(),
        &aged(SnapshotKind::Full, 0, 10, ChronoDuration::hours(30)),
    )
    .await;
    put(
        store.as_ref(),
        &aged(SnapshotKind::Full, 0, 20, ChronoDuration::hours(10)),
    )
    .await;

    let gc = collector(Arc::clone(&store), GarbageCollectionPolicy::LimitBased, 1);
    // Nothing is deletable yet; the cycle must skip, not fail.
    let deleted = gc.collect(Utc::now()).await.unwrap();
    assert_eq!(deleted, 0);
    assert_eq!(store.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_gc_deletes_orphan_deltas() {
    let store = Arc::new(FakeSnapStore::new(""));
    // Deltas whose base full is already gone.
    put(
        store.as_ref(),
        &aged(SnapshotKind::Delta, 11, 20, ChronoDuration::hours(5)),
    )
    .await;
    put(
        store.as_ref(),
        &aged(SnapshotKind::Full, 0, 30, ChronoDuration::minutes(10)),
    )
    .await;

    let gc = collector(Arc::clone(&store), GarbageCollectionPolicy::Exponential, 0);
    let deleted = gc.collect(Utc::now()).await.unwrap();
    assert_eq!(deleted, 1);

    let remaining = store.list().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].kind, SnapshotKind::Full);
}

/// After any GC run the retained set still forms valid chains.
fn assert_valid_chains(snaps: &[Snapshot]) {
    let mut current_full: Option<&Snapshot> = None;
    let mut prev_last = 0;
    for snap in snaps {
        match snap.kind {
            SnapshotKind::Full => {
                current_full = Some(snap);
                prev_last = snap.last_revision;
            }
            SnapshotKind::Delta => {
                let full = current_full.expect("delta without a base full");
                assert!(snap.start_revision > full.last_revision);
                assert_eq!(snap.start_revision, prev_last + 1, "chain gap");
                prev_last = snap.last_revision;
            }
        }
    }
}

#[test]
fn test_secret_modified_time_tracks_credentials_file() {
    let dir = tempfile::tempdir().unwrap();
    let credentials = dir.path().join("credentials.json");
    std::fs::write(&credentials, b"{}").unwrap();

    let mut config = fake_store_config();
    config.provider = trellis::snapstore::SnapstoreProvider::S3;
    config.container = "bucket".to_string();
    config.credentials_file = Some(credentials.clone());

    let first = snapstore_secret_modified_time(&config).unwrap();
    assert!(first > chrono::DateTime::<Utc>::UNIX_EPOCH);

    // Rewriting the file moves the observed time forward (or keeps
    // it equal on coarse filesystems).
    std::fs::write(&credentials, b"{\"rotated\":true}").unwrap();
    let second = snapstore_secret_modified_time(&config).unwrap();
    assert!(second >= first);
}

#[test]
fn test_secret_modified_time_missing_file_is_configuration_error() {
    let mut config = fake_store_config();
    config.provider = trellis::snapstore::SnapstoreProvider::S3;
    config.container = "bucket".to_string();
    config.credentials_file = Some(std::path::PathBuf::from("/definitely/not/here"));

    let err = snapstore_secret_modified_time(&config).unwrap_err();
    assert!(matches!(
        err,
        trellis::error::TrellisError::Configuration { .. }
    ));
}
