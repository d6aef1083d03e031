//! # Chunk Execution
//!
//! The step behavior contract ([`step_handler`]), single-chunk execution
//! ([`step_executor`]) and the pool of tokio workers draining the chunk queue
//! ([`worker_pool`]).

pub mod step_executor;
pub mod step_handler;
pub mod worker_pool;

pub use step_executor::{ChunkExecutionResult, StepExecutor};
pub use step_handler::{
    ChunkContext, ChunkProducer, FnStepHandler, ParameterListProducer, StaticChunkProducer,
    StepHandler, StepOutcome,
};
pub use worker_pool::{WorkerPool, WorkerStatsSnapshot};
