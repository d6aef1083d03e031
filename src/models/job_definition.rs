//! # Job Definitions
//!
//! Static description of a job type: an ordered list of steps, each with its
//! chunking strategy, behavior and parameter schema.

use crate::execution::step_handler::{ChunkProducer, StepHandler};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// How a step fans out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// One chunk per payload, executed in parallel
    Chunked,
    /// All payloads gathered into one chunk (payload is a JSON array)
    Reduction,
}

/// Where a step's payloads come from
#[derive(Clone)]
pub enum ChunkSource {
    /// Derived from the instance parameters
    Parameters(Arc<dyn ChunkProducer>),
    /// Payloads emitted by the previous step's successful chunks
    PreviousStep,
}

impl fmt::Debug for ChunkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parameters(_) => f.write_str("Parameters(..)"),
            Self::PreviousStep => f.write_str("PreviousStep"),
        }
    }
}

/// Declared start parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
    pub required: bool,
    pub description: Option<String>,
}

impl ParameterDefinition {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Clone)]
pub struct StepDefinition {
    pub step_id: String,
    pub kind: StepKind,
    pub source: ChunkSource,
    pub handler: Arc<dyn StepHandler>,
    pub parameters: Vec<ParameterDefinition>,
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("step_id", &self.step_id)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("handler", &self.handler.handler_name())
            .field("parameters", &self.parameters)
            .finish()
    }
}

impl StepDefinition {
    pub fn chunked(
        step_id: impl Into<String>,
        source: ChunkSource,
        handler: Arc<dyn StepHandler>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            kind: StepKind::Chunked,
            source,
            handler,
            parameters: Vec::new(),
        }
    }

    pub fn reduction(
        step_id: impl Into<String>,
        source: ChunkSource,
        handler: Arc<dyn StepHandler>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            kind: StepKind::Reduction,
            source,
            handler,
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: ParameterDefinition) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Names of required parameters missing or blank in `parameters`
    pub fn missing_required_parameters(&self, parameters: &HashMap<String, String>) -> Vec<String> {
        self.parameters
            .iter()
            .filter(|p| p.required)
            .filter(|p| {
                parameters
                    .get(&p.name)
                    .map(|v| v.trim().is_empty())
                    .unwrap_or(true)
            })
            .map(|p| p.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub job_definition_id: String,
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
}

impl JobDefinition {
    pub fn new(job_definition_id: impl Into<String>) -> Self {
        Self {
            job_definition_id: job_definition_id.into(),
            description: None,
            steps: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }

    pub fn first_step(&self) -> Option<&StepDefinition> {
        self.steps.first()
    }

    pub fn last_step_index(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }
}
