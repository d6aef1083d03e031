//! # Step Executor
//!
//! Runs one chunk end to end: claim, invoke the step behavior, record the
//! outcome, then give the sequencer a chance to open the next step.
//!
//! A claim is a compare-and-update in the store, so a notification delivered
//! twice executes at most once. Chunks of instances with a pending
//! cancellation or an unrecoverable error are skipped at claim time and left
//! PENDING. When the outcome of a claimed chunk cannot be written, the claim is
//! released so the chunk is delivered again instead of staying IN_PROGRESS.

use crate::error::{BatchError, BatchResult, StepError};
use crate::events::{EventPublisher, JobLifecycleEvent};
use crate::execution::step_handler::{ChunkContext, StepOutcome};
use crate::logging::log_chunk_operation;
use crate::metrics;
use crate::models::{ChunkWorkNotification, JobInstance, StepDefinition, WorkChunk};
use crate::orchestration::error_classifier::{ErrorClassifier, ErrorContext};
use crate::orchestration::lifecycle::record_transition;
use crate::orchestration::step_sequencer::StepSequencer;
use crate::registry::JobDefinitionRegistry;
use crate::store::{ChunkClaim, ChunkCompletion, JobInstanceStore};
use futures::FutureExt;
use opentelemetry::KeyValue;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// What happened to a dequeued notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkExecutionResult {
    Succeeded { records_processed: u64 },
    Failed { fatal: bool },
    /// Duplicate delivery, cancelled or failed instance
    Skipped,
}

#[derive(Clone)]
pub struct StepExecutor {
    registry: Arc<JobDefinitionRegistry>,
    store: Arc<dyn JobInstanceStore>,
    sequencer: Arc<StepSequencer>,
    classifier: Arc<dyn ErrorClassifier>,
    events: EventPublisher,
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

impl StepExecutor {
    pub fn new(
        registry: Arc<JobDefinitionRegistry>,
        store: Arc<dyn JobInstanceStore>,
        sequencer: Arc<StepSequencer>,
        classifier: Arc<dyn ErrorClassifier>,
        events: EventPublisher,
    ) -> Self {
        Self {
            registry,
            store,
            sequencer,
            classifier,
            events,
        }
    }

    pub async fn execute(
        &self,
        notification: ChunkWorkNotification,
    ) -> BatchResult<ChunkExecutionResult> {
        let (chunk, instance) = match self.store.claim_chunk(notification.chunk_id).await? {
            ChunkClaim::Claimed {
                chunk,
                instance,
                started_instance,
            } => {
                if started_instance {
                    record_transition(&self.events, &instance, "start_instance");
                }
                (chunk, instance)
            }
            ChunkClaim::Skipped(reason) => {
                debug!(
                    instance_id = %notification.instance_id,
                    chunk_id = %notification.chunk_id,
                    reason = ?reason,
                    "Chunk skipped"
                );
                return Ok(ChunkExecutionResult::Skipped);
            }
        };

        log_chunk_operation(
            "execute",
            chunk.instance_id,
            chunk.chunk_id,
            &chunk.step_id,
            chunk.status.as_str(),
            None,
        );
        metrics::chunk_executions_total()
            .add(1, &[KeyValue::new("step_id", chunk.step_id.clone())]);

        let started = Instant::now();
        let result = match self.resolve_step(&instance, &chunk) {
            Ok(step) => self.invoke(&step, &instance, &chunk).await,
            Err(e) => Err(e),
        };
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let (completion, execution) = match self
            .finalize(&instance, &chunk, result, duration_ms)
            .await
        {
            Ok(finalized) => finalized,
            Err(e) => {
                self.release_claim(&chunk, &e).await;
                return Err(e);
            }
        };

        if completion.step_drained {
            if let Err(e) = self.sequencer.try_advance(chunk.instance_id).await {
                // The cleaner picks up orphaned advancement on its next pass
                warn!(
                    instance_id = %chunk.instance_id,
                    step_id = %chunk.step_id,
                    error = %e,
                    "Step advancement failed"
                );
            }
        }

        Ok(execution)
    }

    async fn finalize(
        &self,
        instance: &JobInstance,
        chunk: &WorkChunk,
        result: Result<StepOutcome, StepError>,
        duration_ms: f64,
    ) -> BatchResult<(ChunkCompletion, ChunkExecutionResult)> {
        match result {
            Ok(outcome) => {
                let records_processed = outcome.records_processed;
                metrics::chunk_execution_duration().record(
                    duration_ms,
                    &[
                        KeyValue::new("step_id", chunk.step_id.clone()),
                        KeyValue::new("result", "success"),
                    ],
                );
                let completion = self.store.complete_chunk(chunk.chunk_id, outcome).await?;
                log_chunk_operation(
                    "complete",
                    chunk.instance_id,
                    chunk.chunk_id,
                    &chunk.step_id,
                    completion.chunk.status.as_str(),
                    None,
                );
                Ok((
                    completion,
                    ChunkExecutionResult::Succeeded { records_processed },
                ))
            }
            Err(error) => {
                metrics::chunk_execution_duration().record(
                    duration_ms,
                    &[
                        KeyValue::new("step_id", chunk.step_id.clone()),
                        KeyValue::new("result", "error"),
                    ],
                );
                let (completion, fatal) = self.record_failure(instance, chunk, &error).await?;
                Ok((completion, ChunkExecutionResult::Failed { fatal }))
            }
        }
    }

    /// Hand a claimed chunk back to PENDING after its outcome could not be
    /// recorded. The cleaner re-enqueues it; if this also fails the chunk is
    /// left to stalled-chunk detection.
    async fn release_claim(&self, chunk: &WorkChunk, cause: &BatchError) {
        match self.store.release_chunk(chunk.chunk_id).await {
            Ok(released) => warn!(
                instance_id = %chunk.instance_id,
                chunk_id = %chunk.chunk_id,
                step_id = %chunk.step_id,
                released = released.is_some(),
                error = %cause,
                "Chunk outcome not recorded, claim released"
            ),
            Err(e) => error!(
                instance_id = %chunk.instance_id,
                chunk_id = %chunk.chunk_id,
                step_id = %chunk.step_id,
                error = %cause,
                release_error = %e,
                "Chunk outcome not recorded and claim release failed"
            ),
        }
    }

    fn resolve_step(
        &self,
        instance: &JobInstance,
        chunk: &WorkChunk,
    ) -> Result<StepDefinition, StepError> {
        let definition = self
            .registry
            .get(&instance.job_definition_id)
            .map_err(|e| StepError::unrecoverable(e.to_string()))?;
        definition.step(chunk.step_index).cloned().ok_or_else(|| {
            StepError::unrecoverable(format!(
                "Job definition {} has no step {}",
                instance.job_definition_id, chunk.step_index
            ))
        })
    }

    async fn invoke(
        &self,
        step: &StepDefinition,
        instance: &JobInstance,
        chunk: &WorkChunk,
    ) -> Result<StepOutcome, StepError> {
        let context = ChunkContext {
            instance_id: instance.instance_id,
            chunk_id: chunk.chunk_id,
            job_definition_id: instance.job_definition_id.clone(),
            step_id: step.step_id.clone(),
            step_index: chunk.step_index,
            payload: chunk.payload.clone(),
            parameters: Arc::new(instance.parameters.clone()),
        };

        AssertUnwindSafe(step.handler.process(&context))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(StepError::recoverable(format!(
                    "Step handler {} panicked: {}",
                    step.handler.handler_name(),
                    panic_message(panic.as_ref())
                )))
            })
    }

    async fn record_failure(
        &self,
        instance: &JobInstance,
        chunk: &WorkChunk,
        error: &StepError,
    ) -> BatchResult<(ChunkCompletion, bool)> {
        let classification = self.classifier.classify(
            error,
            &ErrorContext {
                instance_id: instance.instance_id,
                chunk_id: Some(chunk.chunk_id),
                job_definition_id: instance.job_definition_id.clone(),
                step_id: chunk.step_id.clone(),
                step_index: chunk.step_index,
            },
        );
        let fatal = classification.is_fatal();

        warn!(
            instance_id = %chunk.instance_id,
            chunk_id = %chunk.chunk_id,
            step_id = %chunk.step_id,
            severity = %classification.severity,
            error = %classification.error_message,
            "Chunk failed"
        );
        metrics::chunk_failures_total().add(
            1,
            &[
                KeyValue::new("step_id", chunk.step_id.clone()),
                KeyValue::new("fatal", fatal),
            ],
        );

        let completion = self
            .store
            .fail_chunk(chunk.chunk_id, classification.error_message.clone(), fatal)
            .await?;

        self.events.publish(JobLifecycleEvent::ChunkFailed {
            instance_id: chunk.instance_id,
            chunk_id: chunk.chunk_id,
            step_id: chunk.step_id.clone(),
            error_message: classification.error_message,
            fatal,
        });
        if completion.instance_failed {
            record_transition(&self.events, &completion.instance, "fail_instance");
        }
        Ok((completion, fatal))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
