//! # Job Coordinator
//!
//! Control-plane entry point: start, inspect and cancel job instances.
//!
//! None of these operations wait on chunk execution. `start_instance`
//! validates the request, persists a QUEUED instance and returns its id while
//! first-step chunk production runs on a spawned tokio task.

use crate::error::{BatchError, BatchResult};
use crate::events::{EventPublisher, JobLifecycleEvent};
use crate::logging::log_instance_operation;
use crate::metrics;
use crate::models::{JobInstance, JobInstanceStartRequest, WorkChunk};
use crate::orchestration::step_sequencer::StepSequencer;
use crate::registry::JobDefinitionRegistry;
use crate::store::{CancellationOutcome, JobInstanceStore};
use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct JobCoordinator {
    registry: Arc<JobDefinitionRegistry>,
    store: Arc<dyn JobInstanceStore>,
    sequencer: Arc<StepSequencer>,
    events: EventPublisher,
}

impl std::fmt::Debug for JobCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCoordinator")
            .field("registry", &self.registry.stats())
            .finish_non_exhaustive()
    }
}

impl JobCoordinator {
    pub fn new(
        registry: Arc<JobDefinitionRegistry>,
        store: Arc<dyn JobInstanceStore>,
        sequencer: Arc<StepSequencer>,
        events: EventPublisher,
    ) -> Self {
        Self {
            registry,
            store,
            sequencer,
            events,
        }
    }

    /// Validate and persist a new instance, then schedule its first step.
    ///
    /// # Errors
    ///
    /// * [`BatchError::JobDefinitionNotFound`] for an unknown job type
    /// * [`BatchError::InvalidParameter`] for a blank parameter name or a
    ///   required first-step parameter that is missing or blank
    ///
    /// No instance is created when validation fails.
    pub async fn start_instance(&self, request: JobInstanceStartRequest) -> BatchResult<Uuid> {
        let definition = self.registry.get(&request.job_definition_id)?;

        if request.parameters.keys().any(|name| name.trim().is_empty()) {
            return Err(BatchError::InvalidParameter(
                "Parameter names must not be blank".to_string(),
            ));
        }
        if let Some(first_step) = definition.first_step() {
            let missing = first_step.missing_required_parameters(&request.parameters);
            if !missing.is_empty() {
                return Err(BatchError::InvalidParameter(format!(
                    "Missing required parameters for step {}: {}",
                    first_step.step_id,
                    missing.join(", ")
                )));
            }
        }

        let instance = JobInstance::new(&request);
        let instance_id = instance.instance_id;
        self.store.create_instance(instance).await?;

        log_instance_operation(
            "start_instance",
            Some(instance_id),
            Some(&request.job_definition_id),
            "QUEUED",
            None,
        );
        metrics::instances_started_total().add(
            1,
            &[KeyValue::new(
                "job_definition_id",
                request.job_definition_id.clone(),
            )],
        );
        self.events.publish(JobLifecycleEvent::InstanceCreated {
            instance_id,
            job_definition_id: request.job_definition_id,
        });

        let sequencer = Arc::clone(&self.sequencer);
        tokio::spawn(async move {
            if let Err(e) = sequencer.produce_first_step(instance_id).await {
                error!(
                    instance_id = %instance_id,
                    error = %e,
                    "First step production failed"
                );
                if let Err(e) = sequencer
                    .fail_instance(instance_id, format!("Chunk production failed: {e}"))
                    .await
                {
                    error!(instance_id = %instance_id, error = %e, "Unable to fail instance");
                }
            }
        });

        Ok(instance_id)
    }

    /// Latest committed state, with throughput recomputed at read time
    pub async fn get_instance(&self, instance_id: Uuid) -> BatchResult<JobInstance> {
        self.store
            .fetch_instance(instance_id)
            .await?
            .map(|instance| instance.with_derived_metrics(Utc::now()))
            .ok_or(BatchError::InstanceNotFound(instance_id))
    }

    /// Request cooperative cancellation. A terminal instance is left untouched.
    pub async fn cancel_instance(&self, instance_id: Uuid) -> BatchResult<()> {
        match self.store.request_cancellation(instance_id).await? {
            CancellationOutcome::Requested => {
                info!(instance_id = %instance_id, "Cancellation requested");
                self.events
                    .publish(JobLifecycleEvent::CancellationRequested { instance_id });
            }
            CancellationOutcome::AlreadyRequested => {
                debug!(instance_id = %instance_id, "Cancellation already requested");
            }
            CancellationOutcome::AlreadyTerminal(status) => {
                debug!(
                    instance_id = %instance_id,
                    status = %status,
                    "Ignoring cancellation of terminal instance"
                );
            }
        }
        Ok(())
    }

    pub async fn list_instances(&self) -> BatchResult<Vec<JobInstance>> {
        let now = Utc::now();
        Ok(self
            .store
            .list_instances()
            .await?
            .into_iter()
            .map(|instance| instance.with_derived_metrics(now))
            .collect())
    }

    /// Chunks of an instance, for per-chunk error attribution
    pub async fn get_chunks(&self, instance_id: Uuid) -> BatchResult<Vec<WorkChunk>> {
        self.store.fetch_chunks(instance_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobLifecycleEvent> {
        self.events.subscribe()
    }
}
