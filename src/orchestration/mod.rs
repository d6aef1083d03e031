//! # Orchestration Engine
//!
//! Control plane and cross-cutting coordination for job instances.
//!
//! ## Core Components
//!
//! - **JobCoordinator**: start, inspect and cancel instances
//! - **StepSequencer**: cross-step gating and chunk production
//! - **JobCleanerService**: periodic reconciliation toward final status
//! - **ErrorClassifier**: pluggable recoverable/unrecoverable policy
//! - **JobEngine**: wires everything from a `BatchConfig` and owns background tasks

pub mod bootstrap;
pub mod coordinator;
pub mod error_classifier;
pub mod job_cleaner;
pub mod lifecycle;
pub mod step_sequencer;

// Re-export core types and components for easy access
pub use bootstrap::JobEngine;
pub use coordinator::JobCoordinator;
pub use error_classifier::{
    ErrorClassification, ErrorClassifier, ErrorContext, EscalatingErrorClassifier,
    FailureSeverity, StandardErrorClassifier,
};
pub use job_cleaner::{CleanupAction, CleanupPassSummary, JobCleanerService};
pub use step_sequencer::StepSequencer;
