use crate::error::BatchError;
use thiserror::Error;

/// Errors raised while validating instance status transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from} on event {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Instance is in terminal state {state}")]
    TerminalState { state: String },
}

/// Result type alias for state machine operations
pub type StateMachineResult<T> = Result<T, StateMachineError>;

impl From<StateMachineError> for BatchError {
    fn from(err: StateMachineError) -> Self {
        BatchError::StateTransitionError(err.to_string())
    }
}
