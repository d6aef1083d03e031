//! Shared engine fixtures for the integration tests

#![allow(dead_code)]

pub mod strategies;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tasker_batch::{
    BatchConfig, ChunkContext, ChunkSource, JobDefinition, JobDefinitionRegistry, JobEngine,
    JobInstance, JobInstanceStartRequest, ParameterDefinition, ParameterListProducer,
    StepDefinition, StepError, StepHandler, StepOutcome,
};
use tokio::sync::Semaphore;
use uuid::Uuid;

pub const ITEMS_PARAMETER: &str = "items";
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Small intervals so tests settle quickly
pub fn fast_config() -> BatchConfig {
    BatchConfig {
        worker_count: 4,
        cleanup_interval_ms: 20,
        worker_idle_poll_ms: 10,
        ..BatchConfig::default()
    }
}

/// Build and start an engine with the given definitions
pub fn start_engine(definitions: impl IntoIterator<Item = JobDefinition>) -> JobEngine {
    let registry = definitions
        .into_iter()
        .fold(JobDefinitionRegistry::builder(), |builder, definition| {
            builder.register(definition)
        })
        .build()
        .expect("registry should build");
    let engine = JobEngine::new(fast_config(), registry).expect("engine should build");
    engine.start().expect("engine should start");
    engine
}

/// Step handler driven by its payload:
///
/// - `ok:N` succeeds with N records
/// - `recoverable:MSG` / `unrecoverable:MSG` fail with MSG
/// - `hold:N` waits for [`ScriptedHandler::release`], then succeeds with N records
/// - `panic:MSG` panics
#[derive(Debug)]
pub struct ScriptedHandler {
    gate: Semaphore,
    started: AtomicUsize,
}

impl Default for ScriptedHandler {
    fn default() -> Self {
        Self {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
        }
    }
}

impl ScriptedHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub async fn wait_started(&self, count: usize) {
        tokio::time::timeout(SETTLE_TIMEOUT, async {
            while self.started() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("chunks should start");
    }
}

#[async_trait]
impl StepHandler for ScriptedHandler {
    async fn process(&self, context: &ChunkContext) -> Result<StepOutcome, StepError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let script = context.payload_str()?;
        let (verb, arg) = script.split_once(':').unwrap_or((script, ""));
        match verb {
            "ok" => Ok(StepOutcome::processed(arg.parse().unwrap_or(0))),
            "recoverable" => Err(StepError::recoverable(arg)),
            "unrecoverable" => Err(StepError::unrecoverable(arg)),
            "hold" => {
                let permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|e| StepError::recoverable(e.to_string()))?;
                permit.forget();
                Ok(StepOutcome::processed(arg.parse().unwrap_or(0)))
            }
            "panic" => panic!("{arg}"),
            other => Err(StepError::unrecoverable(format!("Unknown script {other}"))),
        }
    }

    fn handler_name(&self) -> &'static str {
        "scripted_handler"
    }
}

/// One chunk per comma separated entry of `items`
pub fn scripted_job(job_definition_id: &str, handler: Arc<ScriptedHandler>) -> JobDefinition {
    JobDefinition::new(job_definition_id).with_step(
        StepDefinition::chunked(
            "run",
            ChunkSource::Parameters(Arc::new(ParameterListProducer::new(ITEMS_PARAMETER))),
            handler,
        )
        .with_parameter(ParameterDefinition::required(ITEMS_PARAMETER)),
    )
}

pub fn items_request(job_definition_id: &str, items: &[&str]) -> JobInstanceStartRequest {
    JobInstanceStartRequest::new(job_definition_id).with_parameter(ITEMS_PARAMETER, items.join(","))
}

pub async fn run_to_settled(
    engine: &JobEngine,
    request: JobInstanceStartRequest,
) -> (Uuid, JobInstance) {
    let id = engine
        .coordinator()
        .start_instance(request)
        .await
        .expect("start should succeed");
    let instance = engine
        .await_settled(id, SETTLE_TIMEOUT)
        .await
        .expect("instance should settle");
    (id, instance)
}

/// String payload of a chunk, for assertions
pub fn payload_text(payload: &Value) -> &str {
    payload.as_str().unwrap_or_default()
}
