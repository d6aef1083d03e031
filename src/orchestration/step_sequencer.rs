//! # Step Sequencer
//!
//! Owns cross-step gating. Chunks of step N+1 are created and enqueued only
//! after step N is fully produced and every one of its chunks has finished.
//!
//! ## Activation Flow
//!
//! 1. Resolve the step's payloads: run its [`ChunkProducer`] against the
//!    instance parameters, or gather the payloads emitted by the previous
//!    step's successful chunks
//! 2. Fold them into one array payload for a reduction step
//! 3. Persist the chunks as PENDING and mark production complete
//! 4. Enqueue one notification per chunk
//!
//! Advancement itself is a compare-and-update in the store, so executors and
//! the cleaner may race on [`StepSequencer::try_advance`] and exactly one of
//! them activates the next step.
//!
//! [`ChunkProducer`]: crate::execution::step_handler::ChunkProducer

use crate::error::{BatchError, BatchResult};
use crate::events::{EventPublisher, JobLifecycleEvent};
use crate::models::{ChunkSource, JobDefinition, JobInstance, StepKind, WorkChunk};
use crate::orchestration::lifecycle::record_transition;
use crate::queue::ChunkQueue;
use crate::registry::JobDefinitionRegistry;
use crate::state_machine::ChunkStatus;
use crate::store::JobInstanceStore;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct StepSequencer {
    registry: Arc<JobDefinitionRegistry>,
    store: Arc<dyn JobInstanceStore>,
    queue: Arc<ChunkQueue>,
    events: EventPublisher,
}

impl std::fmt::Debug for StepSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepSequencer")
            .field("queue_depth", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl StepSequencer {
    pub fn new(
        registry: Arc<JobDefinitionRegistry>,
        store: Arc<dyn JobInstanceStore>,
        queue: Arc<ChunkQueue>,
        events: EventPublisher,
    ) -> Self {
        Self {
            registry,
            store,
            queue,
            events,
        }
    }

    /// Produce and enqueue the chunks of step 0, then advance through any
    /// steps that finish without work
    pub async fn produce_first_step(&self, instance_id: Uuid) -> BatchResult<()> {
        let instance = self.fetch(instance_id).await?;
        if !instance.accepts_dispatch() {
            debug!(
                instance_id = %instance_id,
                status = %instance.status,
                "Skipping first step production, instance no longer dispatchable"
            );
            return Ok(());
        }

        let definition = self.registry.get(&instance.job_definition_id)?;
        self.activate_step(&instance, &definition, 0, Vec::new())
            .await?;
        self.try_advance(instance_id).await?;
        Ok(())
    }

    /// Advance past every drained step that is not the last one.
    ///
    /// Returns how many steps this call advanced. The last step is never
    /// advanced past; finalizing the instance belongs to the cleaner.
    pub async fn try_advance(&self, instance_id: Uuid) -> BatchResult<usize> {
        let mut advanced = 0;

        loop {
            let instance = self.fetch(instance_id).await?;
            let definition = self.registry.get(&instance.job_definition_id)?;
            let from_step = instance.current_step_index;

            if from_step >= definition.last_step_index() {
                break;
            }
            if !self.store.advance_step(instance_id, from_step).await? {
                break;
            }
            advanced += 1;

            let upstream = self.emitted_payloads(instance_id, from_step).await?;
            self.activate_step(&instance, &definition, from_step + 1, upstream)
                .await?;
        }

        Ok(advanced)
    }

    async fn activate_step(
        &self,
        instance: &JobInstance,
        definition: &JobDefinition,
        step_index: usize,
        upstream: Vec<Value>,
    ) -> BatchResult<()> {
        let instance_id = instance.instance_id;
        let step = definition.step(step_index).ok_or_else(|| {
            BatchError::Internal(format!(
                "Job definition {} has no step {step_index}",
                definition.job_definition_id
            ))
        })?;

        let missing = step.missing_required_parameters(&instance.parameters);
        if !missing.is_empty() {
            let message = format!(
                "Step {} is missing required parameters: {}",
                step.step_id,
                missing.join(", ")
            );
            return self.fail_instance(instance_id, message).await;
        }

        let payloads = match &step.source {
            ChunkSource::Parameters(producer) => {
                match producer.produce(&instance.parameters).await {
                    Ok(payloads) => payloads,
                    Err(e) => {
                        let message =
                            format!("Chunk production for step {} failed: {e}", step.step_id);
                        return self.fail_instance(instance_id, message).await;
                    }
                }
            }
            ChunkSource::PreviousStep => upstream,
        };

        let payloads = match step.kind {
            StepKind::Chunked => payloads,
            StepKind::Reduction => vec![Value::Array(payloads)],
        };

        let chunks = self
            .store
            .create_chunks(instance_id, step_index, &step.step_id, payloads)
            .await?;
        let chunk_ids: Vec<Uuid> = chunks.iter().map(|c| c.chunk_id).collect();
        self.store
            .mark_chunks_enqueued(instance_id, &chunk_ids, Utc::now())
            .await?;
        self.store
            .mark_step_production_complete(instance_id, step_index)
            .await?;
        self.queue
            .enqueue_all(chunks.iter().map(WorkChunk::notification))?;

        info!(
            instance_id = %instance_id,
            step_id = %step.step_id,
            step_index = step_index,
            chunk_count = chunks.len(),
            "Step activated"
        );
        self.events.publish(JobLifecycleEvent::StepAdvanced {
            instance_id,
            step_index,
            chunk_count: chunks.len(),
        });
        Ok(())
    }

    /// Payloads emitted by the successful chunks of `step_index`, in chunk creation order
    async fn emitted_payloads(&self, instance_id: Uuid, step_index: usize) -> BatchResult<Vec<Value>> {
        let chunks = self.store.fetch_chunks(instance_id).await?;
        Ok(chunks
            .into_iter()
            .filter(|c| c.step_index == step_index && c.status == ChunkStatus::Success)
            .flat_map(|c| c.emitted)
            .collect())
    }

    /// Record an unrecoverable instance-level error and move the instance to FAILED
    pub async fn fail_instance(&self, instance_id: Uuid, message: String) -> BatchResult<()> {
        warn!(instance_id = %instance_id, error = %message, "Failing instance");
        if let Some(instance) = self.store.fail_instance(instance_id, message).await? {
            record_transition(&self.events, &instance, "fail_instance");
        }
        Ok(())
    }

    async fn fetch(&self, instance_id: Uuid) -> BatchResult<JobInstance> {
        self.store
            .fetch_instance(instance_id)
            .await?
            .ok_or(BatchError::InstanceNotFound(instance_id))
    }
}
