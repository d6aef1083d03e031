//! # Data Model
//!
//! - [`job_definition`] - static job types and their steps
//! - [`job_instance`] - start requests and the mutable instance record
//! - [`chunk`] - work chunks, queue notifications and chunk tallies

pub mod chunk;
pub mod job_definition;
pub mod job_instance;

pub use chunk::{ChunkTally, ChunkWorkNotification, WorkChunk};
pub use job_definition::{ChunkSource, JobDefinition, ParameterDefinition, StepDefinition, StepKind};
pub use job_instance::{JobInstance, JobInstanceStartRequest};
