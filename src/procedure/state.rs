//! Run states of the beam shower procedure.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a [`BeamShowerProcedure`](super::BeamShowerProcedure).
///
/// ```text
/// Idle -> Preparing -> Running -> Resetting -------------> Finished -> Idle
///             |           \-> Stopping -> Resetting --/
///             |-> Idle (nothing mutated yet)
///             \-> Resetting -> Failed -> Idle
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    /// No run in progress; `start` is allowed.
    Idle,
    /// State captured, mutation sequence in progress.
    Preparing,
    /// Hardware is in shower state and the countdown is running.
    Running,
    /// Cancellation requested; reset follows immediately.
    Stopping,
    /// Restoring the saved state.
    Resetting,
    /// Saved state replayed.
    Finished,
    /// The run or its restore failed; errors were reported.
    Failed,
}

impl RunState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Preparing)
                | (Idle, Resetting)
                | (Preparing, Idle)
                | (Preparing, Running)
                | (Preparing, Stopping)
                | (Preparing, Resetting)
                | (Running, Stopping)
                | (Running, Resetting)
                | (Stopping, Resetting)
                | (Resetting, Finished)
                | (Resetting, Failed)
                | (Finished, Idle)
                | (Failed, Idle)
        )
    }

    /// True while hardware may be away from its saved state.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunState::Preparing | RunState::Running | RunState::Stopping | RunState::Resetting
        )
    }

    /// True once a run has ended and before `clear`.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Finished | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
