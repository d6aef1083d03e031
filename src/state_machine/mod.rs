// State machine module for job instance lifecycle
//
// Status enums for instances and chunks, the events that move an instance
// between states, and the transition table that validates each move.

pub mod errors;
pub mod events;
pub mod instance_state_machine;
pub mod states;

// Re-export main types for convenient access
pub use errors::{StateMachineError, StateMachineResult};
pub use events::InstanceEvent;
pub use instance_state_machine::InstanceStateMachine;
pub use states::{ChunkStatus, JobStatus};
