//! `RESTART_CLIENT` handling: decide whether this manager still belongs in the
//! fleet as the supervisor sees it, then either terminate or reconcile.
//!
//! The decision is computed synchronously from already-known state. Once made
//! it is final: a failed announcement afterwards is logged, never rolled back.

use async_trait::async_trait;

use crate::bridge::protocol::{ConditionalRestart, Envelope, RestartDirective};
use crate::dispatch::{EventHandler, HandlerError};
use crate::rebroadcast::Rebroadcaster;
use crate::state::{KillReason, StateError, WorkerIdentity, WorkerState};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Terminate(KillReason),
    Reconcile(ConditionalRestart),
}

/// Compare a restart directive against the current identity.
///
/// A changed shard count alone does not force a restart: as long as every
/// shard this manager owns is still in the expected set it keeps running.
/// The containment check is one-directional (ours ⊆ expected).
pub fn decide(identity: &WorkerIdentity, directive: RestartDirective) -> Decision {
    let restart = match directive {
        RestartDirective::Forced => return Decision::Terminate(KillReason::ForcedRestart),
        RestartDirective::Conditional(restart) => restart,
    };

    if restart.target_cluster_id != identity.cluster_id() {
        return Decision::Terminate(KillReason::ClusterIdMismatch);
    }

    if restart.expected_shard_count != identity.shard_count()
        && !identity.shards().is_subset(&restart.expected_shards)
    {
        return Decision::Terminate(KillReason::Resharding);
    }

    Decision::Reconcile(restart)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Terminated(KillReason),
    Reconciled { announced: usize },
    /// The manager was already terminating.
    Ignored,
}

pub struct RestartHandler {
    rebroadcaster: Rebroadcaster,
}

impl RestartHandler {
    pub fn new(rebroadcaster: Rebroadcaster) -> Self {
        Self { rebroadcaster }
    }

    pub fn reconcile(
        &self,
        state: &mut WorkerState,
        directive: RestartDirective,
    ) -> Result<Outcome, StateError> {
        if state.is_terminated() {
            return Ok(Outcome::Ignored);
        }

        tracing::info!("Received restart event, checking whether sharding options have changed");

        let restart = match decide(state.current(), directive) {
            Decision::Terminate(reason) => {
                state.terminate(reason);
                return Ok(Outcome::Terminated(reason));
            }
            Decision::Reconcile(restart) => restart,
        };

        let announced = self.rebroadcaster.announce_owned();
        state.commit(restart.session, restart.state)?;
        self.rebroadcaster.announce_ready(state.current());

        tracing::info!(
            cluster_id = state.current().cluster_id(),
            expected_shard_count = restart.expected_shard_count,
            announced,
            "Reconciled with supervisor"
        );
        Ok(Outcome::Reconciled { announced })
    }
}

#[async_trait]
impl EventHandler for RestartHandler {
    async fn handle(
        &self,
        state: &mut WorkerState,
        envelope: Envelope,
    ) -> Result<(), HandlerError> {
        let directive: RestartDirective = envelope.payload()?;
        self.reconcile(state, directive)?;
        Ok(())
    }
}
