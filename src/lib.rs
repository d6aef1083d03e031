#![allow(clippy::doc_markdown)] // Allow technical terms like NDJSON, FHIR in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Batch
//!
//! Chunk-oriented batch job orchestration on tokio.
//!
//! ## Overview
//!
//! A job definition is an ordered list of steps. Each step splits its input into
//! independent work chunks which a pool of workers executes in parallel. Step N+1
//! is only produced once every chunk of step N has finished, and a periodic
//! cleaner reconciles chunk outcomes into one final instance status.
//!
//! ## Key Features
//!
//! - **Non-blocking control plane**: start, inspect and cancel instances without
//!   waiting on execution
//! - **Parallel chunk workers**: at-least-once delivery with claim-based
//!   exactly-once execution
//! - **Error policy**: recoverable chunk failures leave siblings running,
//!   unrecoverable ones stop further dispatch
//! - **Reconciliation**: counters recomputed from chunk state, orphaned chunks
//!   re-enqueued, final status decided idempotently
//!
//! ## Module Organization
//!
//! - [`models`] - job definitions, instances and work chunks
//! - [`state_machine`] - instance and chunk status with validated transitions
//! - [`store`] - the job instance store trait and its in-memory implementation
//! - [`queue`] - multi-producer multi-consumer chunk queue
//! - [`execution`] - step handlers, chunk execution and the worker pool
//! - [`orchestration`] - coordinator, step sequencer, cleaner and engine bootstrap
//! - [`registry`] - job definition catalog
//! - [`events`] - lifecycle event broadcast
//! - [`jobs`] - ready-made job definitions
//! - [`config`] - layered configuration
//! - [`error`] - structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tasker_batch::{
//!     BatchConfig, ChunkContext, ChunkSource, FnStepHandler, JobDefinition,
//!     JobDefinitionRegistry, JobEngine, JobInstanceStartRequest, ParameterListProducer,
//!     StepDefinition, StepOutcome,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let definition = JobDefinition::new("word-count").with_step(StepDefinition::chunked(
//!     "count",
//!     ChunkSource::Parameters(Arc::new(ParameterListProducer::new("words"))),
//!     Arc::new(FnStepHandler::new(|_: &ChunkContext| Ok(StepOutcome::processed(1)))),
//! ));
//! let registry = JobDefinitionRegistry::builder().register(definition).build()?;
//!
//! let engine = JobEngine::new(BatchConfig::default(), registry)?;
//! engine.start()?;
//!
//! let id = engine
//!     .coordinator()
//!     .start_instance(JobInstanceStartRequest::new("word-count").with_parameter("words", "a,b,c"))
//!     .await?;
//! let instance = engine.await_settled(id, std::time::Duration::from_secs(10)).await?;
//! assert_eq!(instance.combined_records_processed, 3);
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod orchestration;
pub mod queue;
pub mod registry;
pub mod state_machine;
pub mod store;

pub use config::BatchConfig;
pub use error::{BatchError, BatchResult, StepError};
pub use events::{EventPublisher, JobLifecycleEvent};
pub use execution::{
    ChunkContext, ChunkExecutionResult, ChunkProducer, FnStepHandler, ParameterListProducer,
    StaticChunkProducer, StepExecutor, StepHandler, StepOutcome, WorkerPool, WorkerStatsSnapshot,
};
pub use models::{
    ChunkSource, ChunkTally, ChunkWorkNotification, JobDefinition, JobInstance,
    JobInstanceStartRequest, ParameterDefinition, StepDefinition, StepKind, WorkChunk,
};
pub use orchestration::{
    CleanupAction, CleanupPassSummary, ErrorClassification, ErrorClassifier, ErrorContext,
    EscalatingErrorClassifier, FailureSeverity, JobCleanerService, JobCoordinator, JobEngine,
    StandardErrorClassifier, StepSequencer,
};
pub use queue::ChunkQueue;
pub use registry::JobDefinitionRegistry;
pub use state_machine::{ChunkStatus, JobStatus};
pub use store::{InMemoryJobInstanceStore, JobInstanceStore};
