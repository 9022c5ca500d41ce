//! Leader election and multi-node initialization tests.

mod common;

use common::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use trellis::initializer::{Initializer, InitializerConfig};
use trellis::kv::embedded::EmbeddedKv;
use trellis::kv::KvClient;
use trellis::leader::{
    ElectorState, LeaderCallbacks, LeaderElectionConfig, LeaderElector, MemberLeaseCallbacks,
};
use trellis::observability::MetricsRegistry;

/// An elector polling a live embedded KV follows leadership flips.
#[tokio::test]
async fn test_elector_follows_member_status() {
    let kv = Arc::new(EmbeddedKv::new("m0"));
    kv.set_leader(false);

    let started = Arc::new(AtomicU32::new(0));
    let stopped = Arc::new(AtomicU32::new(0));
    let (started_cb, stopped_cb) = (Arc::clone(&started), Arc::clone(&stopped));

    let mut elector = LeaderElector::new(
        LeaderElectionConfig {
            reelection_period: Duration::from_millis(50),
            connection_timeout: Duration::from_secs(1),
        },
        Arc::clone(&kv) as Arc<dyn KvClient>,
        LeaderCallbacks {
            on_started_leading: Box::new(move || {
                started_cb.fetch_add(1, Ordering::SeqCst);
            }),
            on_stopped_leading: Box::new(move || {
                stopped_cb.fetch_add(1, Ordering::SeqCst);
            }),
        },
        MemberLeaseCallbacks {
            start_lease_renewal: Box::new(|| {}),
            stop_lease_renewal: Box::new(|| {}),
        },
        None,
    );

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(async move {
        elector.run(stop_rx).await.unwrap();
        elector.current_state
    });

    kv.set_leader(true);
    wait_until(
        || started.load(Ordering::SeqCst) == 1,
        Duration::from_secs(5),
    )
    .await;

    kv.set_leader(false);
    wait_until(
        || stopped.load(Ordering::SeqCst) == 1,
        Duration::from_secs(5),
    )
    .await;

    let _ = stop_tx.send(true);
    let final_state = task.await.unwrap();
    assert_eq!(final_state, ElectorState::Follower);
}

fn multi_node_initializer(data_dir: std::path::PathBuf, kv: Arc<EmbeddedKv>) -> Initializer {
    Initializer::new(
        InitializerConfig {
            data_dir,
            cluster_name: "alpha".to_string(),
            member_id: "m0".to_string(),
            cluster_size: 3,
            fail_below_revision: 0,
            defrag_event_batch: 100,
            restore_timeout_secs: 60,
            defrag_timeout_secs: 10,
            embedded_quota_bytes: 64 * 1024 * 1024,
            snapstore: Some(fake_store_config()),
        },
        kv,
        Arc::new(MetricsRegistry::new()),
    )
}

/// A member already in the cluster with a broken directory leaves
/// the cluster, wipes the directory and rejoins as a learner.
#[tokio::test]
async fn test_multi_node_rejoin_as_learner() {
    let root = tempfile::tempdir().unwrap();
    let data_dir = root.path().join("member-0");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::write(data_dir.join("cluster"), "alpha").unwrap();
    std::fs::write(data_dir.join("db"), b"broken").unwrap();

    // Member heartbeat present: the embedded KV lists m0.
    let kv = Arc::new(EmbeddedKv::new("m0"));
    kv.set_learner(false);

    let init = multi_node_initializer(data_dir.clone(), Arc::clone(&kv));
    init.initialize().await.unwrap();

    assert!(!data_dir.exists());
    let status = kv.member_status().await.unwrap();
    assert!(status.is_learner);
    assert!(kv.member_list().await.unwrap().contains(&"m0".to_string()));
}

/// A detected scale-up joins as a learner without touching the
/// data directory state beyond the join itself.
#[tokio::test]
async fn test_multi_node_scale_up_joins_as_learner() {
    let root = tempfile::tempdir().unwrap();
    let data_dir = root.path().join("member-0");

    // No heartbeat: this member is not in the cluster yet.
    let kv = Arc::new(EmbeddedKv::new("m0"));
    kv.remove_member().await.unwrap();

    let init = multi_node_initializer(data_dir.clone(), Arc::clone(&kv));
    init.initialize().await.unwrap();

    let status = kv.member_status().await.unwrap();
    assert!(status.is_learner);
}

/// Learner joins retry until the cluster accepts them.
#[tokio::test]
async fn test_multi_node_learner_join_retries() {
    let root = tempfile::tempdir().unwrap();
    let data_dir = root.path().join("member-0");

    let kv = Arc::new(EmbeddedKv::new("m0"));
    kv.remove_member().await.unwrap();
    kv.fail_next_add_learner(4);

    let init = multi_node_initializer(data_dir, Arc::clone(&kv));
    init.initialize().await.unwrap();
    assert!(kv.member_status().await.unwrap().is_learner);
}
