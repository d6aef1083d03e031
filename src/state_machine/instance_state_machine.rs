use super::{
    errors::{StateMachineError, StateMachineResult},
    events::InstanceEvent,
    states::JobStatus,
};

/// Transition table for job instance status.
///
/// Stateless: the store owns the current status and applies the result of
/// [`determine_target_state`](Self::determine_target_state) with a
/// compare-and-update, so two racing callers cannot both win.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceStateMachine;

impl InstanceStateMachine {
    pub fn new() -> Self {
        Self
    }

    /// Determine the target state based on current state and event
    pub fn determine_target_state(
        &self,
        current_state: JobStatus,
        event: &InstanceEvent,
    ) -> StateMachineResult<JobStatus> {
        if current_state.is_terminal() {
            return Err(StateMachineError::TerminalState {
                state: current_state.to_string(),
            });
        }

        let target = match (current_state, event) {
            (JobStatus::Queued, InstanceEvent::Start) => JobStatus::InProgress,

            // An instance whose steps produced no chunks completes without ever starting
            (JobStatus::Queued | JobStatus::InProgress, InstanceEvent::Complete) => {
                JobStatus::Completed
            }

            (JobStatus::InProgress, InstanceEvent::Error) => JobStatus::Errored,

            (_, InstanceEvent::Fail(_)) => JobStatus::Failed,
            (_, InstanceEvent::Cancel) => JobStatus::Cancelled,

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// Check a transition without caring about the target
    pub fn can_transition(&self, current_state: JobStatus, event: &InstanceEvent) -> bool {
        self.determine_target_state(current_state, event).is_ok()
    }
}
