//! Worker identity and lifecycle state.
//!
//! [`WorkerState`] is owned by the dispatch loop and lent to handlers one
//! envelope at a time, so it needs no interior locking.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bridge::protocol::{ClusterId, FleetState, ShardId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("shard count must be positive")]
    ZeroShardCount,
    #[error("no shards assigned")]
    NoShards,
    #[error("shard {shard} is out of range for shard count {shard_count}")]
    ShardOutOfRange { shard: ShardId, shard_count: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("worker is terminating ({0}), state is frozen")]
    Terminated(KillReason),
}

/// Who this manager is within the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    cluster_id: ClusterId,
    shard_count: u32,
    shards: BTreeSet<ShardId>,
    session: Option<String>,
}

impl WorkerIdentity {
    /// Validates that `shards` is a non-empty subset of `0..shard_count`.
    pub fn new(
        cluster_id: ClusterId,
        shard_count: u32,
        shards: impl IntoIterator<Item = ShardId>,
    ) -> Result<Self, IdentityError> {
        if shard_count == 0 {
            return Err(IdentityError::ZeroShardCount);
        }
        let shards: BTreeSet<ShardId> = shards.into_iter().collect();
        if shards.is_empty() {
            return Err(IdentityError::NoShards);
        }
        if let Some(&shard) = shards.iter().find(|&&s| s >= shard_count) {
            return Err(IdentityError::ShardOutOfRange { shard, shard_count });
        }
        Ok(Self {
            cluster_id,
            shard_count,
            shards,
            session: None,
        })
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn shards(&self) -> &BTreeSet<ShardId> {
        &self.shards
    }

    /// Session token from the last successful reconciliation.
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }
}

/// Reason codes logged and reported when the manager decides to restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    ForcedRestart,
    ClusterIdMismatch,
    Resharding,
}

impl KillReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ForcedRestart => "forced_restart",
            Self::ClusterIdMismatch => "cluster_id_mismatch",
            Self::Resharding => "resharding",
        }
    }
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Running,
    /// Terminal. There is no transition out of this phase.
    Terminating {
        reason: KillReason,
        since: DateTime<Utc>,
    },
}

#[derive(Debug)]
pub struct WorkerState {
    identity: WorkerIdentity,
    fleet_state: Option<FleetState>,
    phase: Phase,
    reconciliations: u64,
}

impl WorkerState {
    pub fn new(identity: WorkerIdentity) -> Self {
        Self {
            identity,
            fleet_state: None,
            phase: Phase::Running,
            reconciliations: 0,
        }
    }

    pub fn current(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn fleet_state(&self) -> Option<&FleetState> {
        self.fleet_state.as_ref()
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.phase, Phase::Terminating { .. })
    }

    pub fn termination_reason(&self) -> Option<KillReason> {
        match self.phase {
            Phase::Running => None,
            Phase::Terminating { reason, .. } => Some(reason),
        }
    }

    /// Number of successful commits since startup.
    pub fn reconciliations(&self) -> u64 {
        self.reconciliations
    }

    /// Replace session and fleet state together. Cluster id and shards are untouched.
    pub fn commit(&mut self, session: String, state: FleetState) -> Result<(), StateError> {
        if let Phase::Terminating { reason, .. } = self.phase {
            return Err(StateError::Terminated(reason));
        }
        self.identity.session = Some(session);
        self.fleet_state = Some(state);
        self.reconciliations += 1;
        Ok(())
    }

    /// Enter the terminal phase. The first reason sticks; returns `false` if
    /// the worker was already terminating.
    pub fn terminate(&mut self, reason: KillReason) -> bool {
        if let Phase::Terminating { reason: first, .. } = self.phase {
            tracing::debug!(%first, ignored = %reason, "Already terminating");
            return false;
        }
        tracing::warn!(
            cluster_id = self.identity.cluster_id,
            %reason,
            "Manager terminating"
        );
        self.phase = Phase::Terminating {
            reason,
            since: Utc::now(),
        };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> WorkerIdentity {
        WorkerIdentity::new(3, 4, [2, 3]).unwrap()
    }

    #[test]
    fn identity_rejects_invalid_assignments() {
        assert_eq!(
            WorkerIdentity::new(0, 0, [0]),
            Err(IdentityError::ZeroShardCount)
        );
        assert_eq!(
            WorkerIdentity::new(0, 4, Vec::<ShardId>::new()),
            Err(IdentityError::NoShards)
        );
        assert_eq!(
            WorkerIdentity::new(0, 4, [1, 4]),
            Err(IdentityError::ShardOutOfRange {
                shard: 4,
                shard_count: 4
            })
        );
    }

    #[test]
    fn identity_dedups_shards() {
        let id = WorkerIdentity::new(1, 8, [5, 1, 5]).unwrap();
        assert_eq!(id.shards(), &BTreeSet::from([1, 5]));
        assert!(id.session().is_none());
    }

    #[test]
    fn commit_replaces_session_and_state() {
        let mut state = WorkerState::new(identity());

        state
            .commit("s1".to_string(), FleetState::new(json!({"a": 1})))
            .unwrap();
        state
            .commit("s2".to_string(), FleetState::new(json!("blob")))
            .unwrap();

        assert_eq!(state.current().session(), Some("s2"));
        assert_eq!(state.fleet_state().unwrap().as_value(), &json!("blob"));
        assert_eq!(state.current().shards(), &BTreeSet::from([2, 3]));
        assert_eq!(state.current().cluster_id(), 3);
        assert_eq!(state.reconciliations(), 2);
    }

    #[test]
    fn terminate_is_one_way() {
        let mut state = WorkerState::new(identity());
        assert!(!state.is_terminated());

        assert!(state.terminate(KillReason::Resharding));
        assert!(!state.terminate(KillReason::ForcedRestart));
        assert_eq!(state.termination_reason(), Some(KillReason::Resharding));

        let err = state
            .commit("s9".to_string(), FleetState::new(json!(null)))
            .unwrap_err();
        assert_eq!(err, StateError::Terminated(KillReason::Resharding));
        assert!(state.current().session().is_none());
        assert!(state.fleet_state().is_none());
    }

    #[test]
    fn kill_reason_codes() {
        assert_eq!(KillReason::ForcedRestart.to_string(), "forced_restart");
        assert_eq!(KillReason::ClusterIdMismatch.to_string(), "cluster_id_mismatch");
        assert_eq!(
            serde_json::to_value(KillReason::Resharding).unwrap(),
            json!("resharding")
        );
    }
}
