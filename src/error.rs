//! Error types for the batch orchestration engine.
//!
//! Two families live here. [`BatchError`] is what control-plane callers see
//! (`start_instance`, `get_instance`, `cancel_instance`, store operations).
//! [`StepError`] is what step behaviors return; it never escapes to a
//! control-plane caller and is instead captured into chunk and instance state.

use crate::config::ConfigurationError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BatchError {
    #[error("Job definition not found: {0}")]
    JobDefinitionNotFound(String),
    #[error("Job instance not found: {0}")]
    InstanceNotFound(Uuid),
    #[error("Work chunk not found: {0}")]
    ChunkNotFound(Uuid),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Store error: {0}")]
    StoreError(String),
    #[error("State transition error: {0}")]
    StateTransitionError(String),
    #[error("Event error: {0}")]
    EventError(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BatchError {
    /// True for the errors surfaced as "not found" to control-plane callers
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::JobDefinitionNotFound(_) | Self::InstanceNotFound(_) | Self::ChunkNotFound(_)
        )
    }
}

impl From<serde_json::Error> for BatchError {
    fn from(error: serde_json::Error) -> Self {
        BatchError::Internal(format!("JSON serialization error: {error}"))
    }
}

impl From<ConfigurationError> for BatchError {
    fn from(error: ConfigurationError) -> Self {
        BatchError::ConfigurationError(error.to_string())
    }
}

pub type BatchResult<T> = Result<T, BatchError>;

/// Failure raised by a step behavior or chunk producer.
///
/// The variant is the handler's own opinion of the failure. The final word on
/// whether it aborts the instance belongs to the configured
/// [`ErrorClassifier`](crate::orchestration::error_classifier::ErrorClassifier).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Affects only the current chunk; siblings keep running
    #[error("{0}")]
    Recoverable(String),
    /// The whole instance cannot make progress (bad configuration, corrupt input)
    #[error("{0}")]
    Unrecoverable(String),
}

impl StepError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable(message.into())
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::Unrecoverable(message.into())
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Recoverable(msg) | Self::Unrecoverable(msg) => msg,
        }
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable(_))
    }
}

impl From<anyhow::Error> for StepError {
    fn from(error: anyhow::Error) -> Self {
        StepError::Recoverable(format!("{error:#}"))
    }
}

impl From<std::io::Error> for StepError {
    fn from(error: std::io::Error) -> Self {
        StepError::Recoverable(format!("I/O error: {error}"))
    }
}
