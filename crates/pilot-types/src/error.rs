//! Error kinds surfaced across worker boundaries (spec §7).

use thiserror::Error;

use crate::cu::CuState;

#[derive(Debug, Error)]
pub enum AgentError {
    /// LRMS adapter could not discover resources: fatal to the pilot.
    #[error("misconfigured environment: {0}")]
    MisconfiguredEnvironment(String),

    /// `|nodes| * cores_per_node < requested_cores`: fatal to the pilot.
    #[error("allocation too small: requested {requested} cores, allocation provides {available}")]
    AllocationTooSmall { requested: usize, available: usize },

    /// Launcher binary not found on PATH at configure time: fatal to the pilot.
    #[error("launcher unavailable: {0}")]
    LauncherUnavailable(String),

    /// No slot available; not an error, caller re-queues.
    #[error("scheduler exhausted")]
    SchedulerExhausted,

    /// fork/exec failed: fail the CU, release its slot, continue.
    #[error("spawn failure: {0}")]
    SpawnFailure(String),

    /// link/copy/move/transfer error: fail the CU, skip remaining directives.
    #[error("staging failure: {0}")]
    StagingFailure(String),

    /// Child process exited non-zero: fail the CU.
    #[error("child exited non-zero: {0}")]
    ChildExitNonZero(i32),

    /// Cooperative cancellation observed for a CU.
    #[error("cancel requested")]
    CancelRequested,

    /// A background worker exited unexpectedly: fatal to the pilot.
    #[error("worker died: {0}")]
    WorkerDied(String),

    /// Walltime expired; pilot goes to Done, not Failed.
    #[error("walltime expired")]
    WalltimeExpired,

    /// Coordination store unreachable after retries with bounded backoff.
    #[error("store unreachable: {0}")]
    StoreUnreachable(String),

    /// A CU or pilot state transition would violate the state machine.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: CuState, to: CuState },
}

impl AgentError {
    /// Whether this error kind is fatal to the whole pilot, per the
    /// propagation policy in spec §7 ("Propagation policy").
    pub fn is_pilot_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::MisconfiguredEnvironment(_)
                | AgentError::LauncherUnavailable(_)
                | AgentError::WorkerDied(_)
                | AgentError::StoreUnreachable(_)
                | AgentError::AllocationTooSmall { .. }
        )
    }
}
