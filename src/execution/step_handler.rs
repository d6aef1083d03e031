//! # Step Behavior Contract
//!
//! The two traits applications implement to plug work into the engine:
//! [`StepHandler`] runs one chunk, [`ChunkProducer`] turns instance parameters
//! into the chunk payloads of a step.

use crate::error::StepError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Everything a step handler sees about the chunk it is executing
#[derive(Debug, Clone)]
pub struct ChunkContext {
    pub instance_id: Uuid,
    pub chunk_id: Uuid,
    pub job_definition_id: String,
    pub step_id: String,
    pub step_index: usize,
    pub payload: Value,
    pub parameters: Arc<HashMap<String, String>>,
}

impl ChunkContext {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Parameter the step cannot run without; absence is a job configuration error
    pub fn required_parameter(&self, name: &str) -> Result<&str, StepError> {
        self.parameter(name).ok_or_else(|| {
            StepError::unrecoverable(format!(
                "Missing required parameter '{name}' for step '{}'",
                self.step_id
            ))
        })
    }

    /// Payload as a string, for steps whose chunks are locators
    pub fn payload_str(&self) -> Result<&str, StepError> {
        self.payload.as_str().ok_or_else(|| {
            StepError::unrecoverable(format!(
                "Step '{}' expected a string payload, got {}",
                self.step_id, self.payload
            ))
        })
    }
}

/// Result of a successful chunk execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub records_processed: u64,
    /// Payloads handed to the next step when it is sourced from this one
    pub emitted: Vec<Value>,
}

impl StepOutcome {
    pub fn processed(records_processed: u64) -> Self {
        Self {
            records_processed,
            emitted: Vec::new(),
        }
    }

    pub fn with_emitted(mut self, emitted: Vec<Value>) -> Self {
        self.emitted = emitted;
        self
    }

    pub fn emit(&mut self, payload: Value) {
        self.emitted.push(payload);
    }
}

/// Trait for step behaviors
///
/// Invoked once per chunk, possibly concurrently for sibling chunks of the
/// same step. Long blocking work should be moved to `spawn_blocking` by the
/// implementation; the engine imposes no timeout.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Process one chunk
    ///
    /// * `Ok(outcome)` - chunk succeeded with the reported record count
    /// * `Err(StepError::Recoverable)` - only this chunk failed
    /// * `Err(StepError::Unrecoverable)` - the whole instance must fail
    async fn process(&self, context: &ChunkContext) -> Result<StepOutcome, StepError>;

    /// Name used in logs and metrics
    fn handler_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Produces the chunk payloads of a step from the instance parameters
#[async_trait]
pub trait ChunkProducer: Send + Sync {
    async fn produce(&self, parameters: &HashMap<String, String>)
        -> Result<Vec<Value>, StepError>;
}

/// One chunk per comma separated entry of a parameter
#[derive(Debug, Clone)]
pub struct ParameterListProducer {
    parameter: String,
}

impl ParameterListProducer {
    pub fn new(parameter: impl Into<String>) -> Self {
        Self {
            parameter: parameter.into(),
        }
    }
}

#[async_trait]
impl ChunkProducer for ParameterListProducer {
    async fn produce(
        &self,
        parameters: &HashMap<String, String>,
    ) -> Result<Vec<Value>, StepError> {
        let raw = parameters.get(&self.parameter).ok_or_else(|| {
            StepError::unrecoverable(format!("Missing parameter '{}'", self.parameter))
        })?;

        Ok(raw
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| Value::String(entry.to_string()))
            .collect())
    }
}

/// Fixed payload list, independent of parameters
#[derive(Debug, Clone)]
pub struct StaticChunkProducer {
    payloads: Vec<Value>,
}

impl StaticChunkProducer {
    pub fn new(payloads: Vec<Value>) -> Self {
        Self { payloads }
    }
}

#[async_trait]
impl ChunkProducer for StaticChunkProducer {
    async fn produce(&self, _parameters: &HashMap<String, String>) -> Result<Vec<Value>, StepError> {
        Ok(self.payloads.clone())
    }
}

/// Adapter so closures can serve as step handlers in tests and small jobs
pub struct FnStepHandler<F> {
    func: F,
}

impl<F> FnStepHandler<F>
where
    F: Fn(&ChunkContext) -> Result<StepOutcome, StepError> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> StepHandler for FnStepHandler<F>
where
    F: Fn(&ChunkContext) -> Result<StepOutcome, StepError> + Send + Sync,
{
    async fn process(&self, context: &ChunkContext) -> Result<StepOutcome, StepError> {
        (self.func)(context)
    }

    fn handler_name(&self) -> &'static str {
        "fn_step_handler"
    }
}
