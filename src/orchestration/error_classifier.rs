//! # Step Failure Classification
//!
//! Decides whether a step failure stays local to its chunk (the instance is
//! driven toward ERRORED) or aborts the whole instance (FAILED).
//!
//! The boundary is a policy, not a hard rule, so it is a trait. The
//! [`StandardErrorClassifier`] trusts the handler's own [`StepError`] variant;
//! [`EscalatingErrorClassifier`] additionally promotes recoverable failures
//! whose message matches configured patterns.
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ StepError       │────▶│ ErrorClassifier │────▶│ Classification  │
//! │ + ErrorContext  │     │ policy          │     │ (severity, msg) │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```

use crate::error::StepError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Where a failure happened
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub instance_id: Uuid,
    pub chunk_id: Option<Uuid>,
    pub job_definition_id: String,
    pub step_id: String,
    pub step_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSeverity {
    /// Chunk FAILED, siblings continue
    Recoverable,
    /// Instance FAILED immediately
    Unrecoverable,
}

impl fmt::Display for FailureSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recoverable => write!(f, "recoverable"),
            Self::Unrecoverable => write!(f, "unrecoverable"),
        }
    }
}

/// Result of error classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub severity: FailureSeverity,
    /// Message recorded on the chunk and as the instance's latest error
    pub error_message: String,
}

impl ErrorClassification {
    pub fn is_fatal(&self) -> bool {
        self.severity == FailureSeverity::Unrecoverable
    }
}

pub trait ErrorClassifier: Send + Sync + fmt::Debug {
    fn classify(&self, error: &StepError, context: &ErrorContext) -> ErrorClassification;
}

fn attributed_message(error: &StepError, context: &ErrorContext) -> String {
    format!("Step {} failed: {}", context.step_id, error.message())
}

/// Trusts the variant chosen by the step handler
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardErrorClassifier;

impl StandardErrorClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl ErrorClassifier for StandardErrorClassifier {
    fn classify(&self, error: &StepError, context: &ErrorContext) -> ErrorClassification {
        let severity = match error {
            StepError::Recoverable(_) => FailureSeverity::Recoverable,
            StepError::Unrecoverable(_) => FailureSeverity::Unrecoverable,
        };
        ErrorClassification {
            severity,
            error_message: attributed_message(error, context),
        }
    }
}

/// Promotes recoverable errors whose message contains any configured pattern
#[derive(Debug, Clone, Default)]
pub struct EscalatingErrorClassifier {
    fatal_patterns: Vec<String>,
}

impl EscalatingErrorClassifier {
    pub fn new(fatal_patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            fatal_patterns: fatal_patterns.into_iter().map(Into::into).collect(),
        }
    }
}

impl ErrorClassifier for EscalatingErrorClassifier {
    fn classify(&self, error: &StepError, context: &ErrorContext) -> ErrorClassification {
        let mut classification = StandardErrorClassifier.classify(error, context);
        if !classification.is_fatal()
            && self
                .fatal_patterns
                .iter()
                .any(|pattern| error.message().contains(pattern.as_str()))
        {
            classification.severity = FailureSeverity::Unrecoverable;
        }
        classification
    }
}
