//! Pilot state machine (spec §3 "Pilot state machine"). Only the supervisor
//! writes pilot state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PilotState {
    Launching,
    Active,
    Done,
    Failed,
    Canceled,
}

impl PilotState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PilotState::Done | PilotState::Failed | PilotState::Canceled)
    }

    pub fn can_transition_to(&self, next: PilotState) -> bool {
        use PilotState::*;
        match self {
            Launching => matches!(next, Active | Failed | Canceled),
            Active => matches!(next, Done | Failed | Canceled),
            Done | Failed | Canceled => false,
        }
    }
}
