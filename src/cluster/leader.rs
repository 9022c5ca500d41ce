//! Leader election among peer sidecars.
//!
//! Exactly one sidecar in a multi-member cluster drives snapshotting.
//! The elector periodically probes the local KV member's status and
//! drives a small state machine:
//!
//! - `Follower -> Leader` when the member reports leadership,
//! - `Leader -> Follower` when it no longer does,
//! - any state `-> Unknown` on a probe error,
//! - `Follower/Unknown -> Follower` with a promotion callback when
//!   the member is a learner.
//!
//! Transitions call back into the host: the snapshotter lifecycle is
//! controlled through `on_started_leading` / `on_stopped_leading`,
//! liveness leases through `start_lease_renewal` /
//! `stop_lease_renewal`. The elector and the snapshotter share no
//! mutable data.

use crate::core::error::TrellisResult;
use crate::kv::{KvClient, MemberStatus};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Callback invoked on a state transition.
pub type Callback = Box<dyn Fn() + Send + Sync>;

/// Probe returning the local member's status.
pub type StatusProbe =
    Arc<dyn Fn() -> BoxFuture<'static, TrellisResult<MemberStatus>> + Send + Sync>;

/// Elector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectorState {
    Follower,
    Leader,
    Unknown,
}

/// Snapshotter lifecycle callbacks.
pub struct LeaderCallbacks {
    /// This sidecar became the leading one.
    pub on_started_leading: Callback,
    /// This sidecar stopped leading.
    pub on_stopped_leading: Callback,
}

/// Liveness lease callbacks.
pub struct MemberLeaseCallbacks {
    /// Member is reachable again; resume lease renewal.
    pub start_lease_renewal: Callback,
    /// Member is unreachable; stop lease renewal.
    pub stop_lease_renewal: Callback,
}

/// Learner promotion callback.
pub struct PromoteLearnerCallback {
    /// Turn the learner into a voting member.
    pub promote: Callback,
}

/// Leader election configuration.
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Probe period.
    pub reelection_period: Duration,

    /// Bound on each status probe.
    pub connection_timeout: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            reelection_period: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(30),
        }
    }
}

/// Chooses the single active snapshotter among peer sidecars.
pub struct LeaderElector {
    /// Current elector state.
    pub current_state: ElectorState,

    /// Status probe; replaceable for tests.
    pub check_member_status: StatusProbe,

    config: LeaderElectionConfig,
    leader_callbacks: LeaderCallbacks,
    lease_callbacks: MemberLeaseCallbacks,
    promote_callback: Option<PromoteLearnerCallback>,
    lease_active: bool,
}

impl LeaderElector {
    /// Create an elector probing the given KV client.
    pub fn new(
        config: LeaderElectionConfig,
        kv: Arc<dyn KvClient>,
        leader_callbacks: LeaderCallbacks,
        lease_callbacks: MemberLeaseCallbacks,
        promote_callback: Option<PromoteLearnerCallback>,
    ) -> Self {
        let probe: StatusProbe = Arc::new(move || {
            let kv = Arc::clone(&kv);
            Box::pin(async move { kv.member_status().await })
        });
        Self {
            current_state: ElectorState::Follower,
            check_member_status: probe,
            config,
            leader_callbacks,
            lease_callbacks,
            promote_callback,
            // The host starts lease renewal alongside the elector.
            lease_active: true,
        }
    }

    /// Probe on every reelection tick until stopped.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> TrellisResult<()> {
        tracing::info!(period = ?self.config.reelection_period, "starting leader elector");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.reelection_period) => {
                    let probe = (self.check_member_status)();
                    let result =
                        match tokio::time::timeout(self.config.connection_timeout, probe).await {
                            Ok(result) => result,
                            Err(_) => Err(crate::core::error::TrellisError::kv(
                                "member status probe timed out",
                            )),
                        };
                    self.observe(result);
                }
                _ = stop.changed() => {
                    tracing::info!("stopping leader elector");
                    if self.current_state == ElectorState::Leader {
                        (self.leader_callbacks.on_stopped_leading)();
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Apply one probe result to the state machine.
    pub fn observe(&mut self, result: TrellisResult<MemberStatus>) {
        match result {
            Err(err) => {
                tracing::warn!(error = %err, "member status probe failed");
                if self.current_state == ElectorState::Leader {
                    (self.leader_callbacks.on_stopped_leading)();
                }
                (self.lease_callbacks.stop_lease_renewal)();
                self.lease_active = false;
                self.set_state(ElectorState::Unknown);
            }
            Ok(status) => {
                if !self.lease_active {
                    (self.lease_callbacks.start_lease_renewal)();
                    self.lease_active = true;
                }

                if status.is_learner
                    && matches!(
                        self.current_state,
                        ElectorState::Follower | ElectorState::Unknown
                    )
                {
                    tracing::info!("member is a learner, requesting promotion");
                    if let Some(callback) = &self.promote_callback {
                        (callback.promote)();
                    }
                    self.set_state(ElectorState::Follower);
                } else if status.is_leader {
                    if self.current_state != ElectorState::Leader {
                        tracing::info!("member became leader, starting snapshotter");
                        (self.leader_callbacks.on_started_leading)();
                    }
                    self.set_state(ElectorState::Leader);
                } else {
                    if self.current_state == ElectorState::Leader {
                        tracing::info!("member lost leadership, stopping snapshotter");
                        (self.leader_callbacks.on_stopped_leading)();
                    }
                    self.set_state(ElectorState::Follower);
                }
            }
        }
    }

    fn set_state(&mut self, state: ElectorState) {
        if self.current_state != state {
            tracing::info!(from = ?self.current_state, to = ?state, "leader elector transition");
            self.current_state = state;
        }
    }
}
