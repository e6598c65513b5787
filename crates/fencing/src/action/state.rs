//! Lifecycle of a fence action.
//!
//! ```text
//! Created -> Running -> Succeeded
//!               |  \--> Failed | TimedOut
//!               v
//!            Retrying -> Running ...
//! ```
//!
//! [`transition`] is pure; whoever drives the agent feeds it events and acts
//! on the state it returns.

use crate::error::FenceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionState {
    /// Built, never launched.
    Created,
    /// Attempt `attempt` is running.
    Running { attempt: u32 },
    /// Attempt `attempt` failed and another one will be launched.
    Retrying { attempt: u32, last_error: FenceError },
    Succeeded,
    Failed(FenceError),
    /// The final attempt ran out of time.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionEvent {
    /// A new attempt was started.
    Launched,
    /// The running attempt finished. `may_retry` is the retry budget's verdict.
    Completed {
        result: Result<(), FenceError>,
        may_retry: bool,
    },
    /// A new attempt could not be started.
    LaunchFailed(FenceError),
}

impl ActionState {
    /// Whether no further event can change this state.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::TimedOut)
    }

    /// Final result, once terminal.
    pub fn result(&self) -> Option<Result<(), FenceError>> {
        match self {
            Self::Succeeded => Some(Ok(())),
            Self::Failed(e) => Some(Err(e.clone())),
            Self::TimedOut => Some(Err(FenceError::TimedOut)),
            _ => None,
        }
    }
}

/// Next state after `event`. Events that make no sense in `state` leave it unchanged.
pub fn transition(state: &ActionState, event: ActionEvent) -> ActionState {
    match (state, event) {
        (ActionState::Created, ActionEvent::Launched) => ActionState::Running { attempt: 1 },
        (ActionState::Retrying { attempt, .. }, ActionEvent::Launched) => ActionState::Running {
            attempt: attempt + 1,
        },
        (
            ActionState::Created | ActionState::Retrying { .. } | ActionState::Running { .. },
            ActionEvent::LaunchFailed(e),
        ) => ActionState::Failed(e),
        (ActionState::Running { .. }, ActionEvent::Completed { result: Ok(()), .. }) => {
            ActionState::Succeeded
        }
        (
            ActionState::Running { attempt },
            ActionEvent::Completed {
                result: Err(e),
                may_retry: true,
            },
        ) => ActionState::Retrying {
            attempt: *attempt,
            last_error: e,
        },
        (
            ActionState::Running { .. },
            ActionEvent::Completed {
                result: Err(FenceError::TimedOut),
                may_retry: false,
            },
        ) => ActionState::TimedOut,
        (
            ActionState::Running { .. },
            ActionEvent::Completed {
                result: Err(e),
                may_retry: false,
            },
        ) => ActionState::Failed(e),
        (state, _) => state.clone(),
    }
}
