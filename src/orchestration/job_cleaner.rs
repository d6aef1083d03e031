//! # Job Cleaner / Reconciler
//!
//! Periodic pass that drives non-terminal instances toward their final status
//! and tidies up after terminal ones.
//!
//! ## Per-instance Decision
//!
//! Evaluated on one consistent snapshot of the instance and its chunks:
//!
//! 1. Raise `error_count` and `combined_records_processed` to the values
//!    recomputed from chunk state
//! 2. Unrecoverable error recorded → FAILED
//! 3. Cancellation requested and nothing IN_PROGRESS → CANCELLED; otherwise
//!    release IN_PROGRESS chunks claimed longer than `stalled_chunk_seconds` ago
//! 4. Current step still open → release stalled IN_PROGRESS chunks, then
//!    re-enqueue them together with PENDING chunks whose last delivery is older
//!    than `orphaned_chunk_requeue_seconds`
//! 5. Current step drained but not the last one → advance
//! 6. Last step drained without errors → COMPLETED
//! 7. Last step drained with errors → ERRORED
//!
//! Terminal instances whose `end_time` is older than `chunk_retention_seconds`
//! have their chunks purged.
//!
//! Every store write is compare-and-update, so a pass is idempotent and safe
//! to run concurrently with itself and with workers.

use crate::config::BatchConfig;
use crate::error::BatchResult;
use crate::events::EventPublisher;
use crate::metrics;
use crate::models::{ChunkTally, JobInstance, WorkChunk};
use crate::orchestration::lifecycle::record_transition;
use crate::orchestration::step_sequencer::StepSequencer;
use crate::queue::ChunkQueue;
use crate::registry::JobDefinitionRegistry;
use crate::state_machine::{ChunkStatus, InstanceEvent, JobStatus};
use crate::store::JobInstanceStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Action taken for one instance during a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupAction {
    Completed,
    Errored,
    Failed,
    Cancelled,
    StepsAdvanced(usize),
    /// Stalled chunks returned to PENDING without being re-enqueued
    ChunksReleased(usize),
    ChunksRequeued {
        requeued: usize,
        released: usize,
    },
    NoAction,
}

/// What one cleanup pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupPassSummary {
    pub instances_examined: usize,
    pub counters_reconciled: usize,
    pub completed: usize,
    pub errored: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub steps_advanced: usize,
    pub chunks_requeued: usize,
    pub chunks_released: usize,
    pub chunks_purged: usize,
}

impl CleanupPassSummary {
    pub fn transitions(&self) -> usize {
        self.completed + self.errored + self.failed + self.cancelled
    }

    pub fn is_noop(&self) -> bool {
        self.counters_reconciled == 0
            && self.transitions() == 0
            && self.steps_advanced == 0
            && self.chunks_requeued == 0
            && self.chunks_released == 0
            && self.chunks_purged == 0
    }

    fn record(&mut self, action: CleanupAction) {
        match action {
            CleanupAction::Completed => self.completed += 1,
            CleanupAction::Errored => self.errored += 1,
            CleanupAction::Failed => self.failed += 1,
            CleanupAction::Cancelled => self.cancelled += 1,
            CleanupAction::StepsAdvanced(count) => self.steps_advanced += count,
            CleanupAction::ChunksReleased(count) => self.chunks_released += count,
            CleanupAction::ChunksRequeued { requeued, released } => {
                self.chunks_requeued += requeued;
                self.chunks_released += released;
            }
            CleanupAction::NoAction => {}
        }
    }
}

#[derive(Clone)]
pub struct JobCleanerService {
    registry: Arc<JobDefinitionRegistry>,
    store: Arc<dyn JobInstanceStore>,
    queue: Arc<ChunkQueue>,
    sequencer: Arc<StepSequencer>,
    events: EventPublisher,
    interval: Duration,
    requeue_after: ChronoDuration,
    stalled_after: ChronoDuration,
    retention: ChronoDuration,
}

impl std::fmt::Debug for JobCleanerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCleanerService")
            .field("interval", &self.interval)
            .field("requeue_after", &self.requeue_after)
            .field("stalled_after", &self.stalled_after)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl JobCleanerService {
    pub fn new(
        registry: Arc<JobDefinitionRegistry>,
        store: Arc<dyn JobInstanceStore>,
        queue: Arc<ChunkQueue>,
        sequencer: Arc<StepSequencer>,
        events: EventPublisher,
        config: &BatchConfig,
    ) -> Self {
        Self {
            registry,
            store,
            queue,
            sequencer,
            events,
            interval: config.cleanup_interval(),
            requeue_after: config.orphaned_chunk_requeue_after(),
            stalled_after: config.stalled_chunk_after(),
            retention: config.chunk_retention(),
        }
    }

    /// Run the cleaner every `cleanup_interval_ms` until `shutdown` flips to true.
    ///
    /// A failed pass is logged and the loop continues.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting job cleaner"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.run_cleanup_pass().await {
                error!(error = %e, "Cleanup pass failed");
            }
        }

        info!("Job cleaner stopped");
    }

    pub async fn run_cleanup_pass(&self) -> BatchResult<CleanupPassSummary> {
        let started = Instant::now();
        let now = Utc::now();
        let mut summary = CleanupPassSummary::default();

        for instance in self.store.list_instances().await? {
            if instance.is_terminal() {
                summary.chunks_purged += self.purge_expired(&instance, now).await;
                continue;
            }

            summary.instances_examined += 1;
            match self.reconcile_instance(instance.instance_id, now, &mut summary).await {
                Ok(action) => summary.record(action),
                Err(e) => warn!(
                    instance_id = %instance.instance_id,
                    error = %e,
                    "Unable to reconcile instance"
                ),
            }
        }

        metrics::cleanup_pass_duration().record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        if summary.is_noop() {
            debug!(
                instances_examined = summary.instances_examined,
                "Cleanup pass found nothing to do"
            );
        } else {
            info!(
                instances_examined = summary.instances_examined,
                counters_reconciled = summary.counters_reconciled,
                transitions = summary.transitions(),
                steps_advanced = summary.steps_advanced,
                chunks_requeued = summary.chunks_requeued,
                chunks_released = summary.chunks_released,
                chunks_purged = summary.chunks_purged,
                "Cleanup pass completed"
            );
        }
        Ok(summary)
    }

    async fn reconcile_instance(
        &self,
        instance_id: Uuid,
        now: DateTime<Utc>,
        summary: &mut CleanupPassSummary,
    ) -> BatchResult<CleanupAction> {
        let Some(snapshot) = self.store.snapshot(instance_id).await? else {
            return Ok(CleanupAction::NoAction);
        };
        let instance = snapshot.instance;
        let chunks = snapshot.chunks;
        if instance.is_terminal() {
            return Ok(CleanupAction::NoAction);
        }

        let tally = ChunkTally::from_chunks(&chunks);
        let error_count = instance.error_count.max(tally.failed as u64);
        if self
            .store
            .reconcile_counters(instance_id, tally.failed as u64, tally.records_processed)
            .await?
        {
            summary.counters_reconciled += 1;
        }

        if instance.fatal_error {
            let message = instance
                .error_message
                .clone()
                .unwrap_or_else(|| "Unrecoverable error".to_string());
            return self
                .transition(&instance, InstanceEvent::Fail(message), CleanupAction::Failed)
                .await;
        }

        if instance.cancel_requested {
            if tally.in_progress > 0 {
                let released = self.release_stalled(&instance, &chunks, now).await?;
                return Ok(match released.len() {
                    0 => CleanupAction::NoAction,
                    count => CleanupAction::ChunksReleased(count),
                });
            }
            return self
                .transition(&instance, InstanceEvent::Cancel, CleanupAction::Cancelled)
                .await;
        }

        if !instance.step_production_complete {
            return Ok(CleanupAction::NoAction);
        }

        let step_open = chunks
            .iter()
            .any(|c| c.step_index == instance.current_step_index && c.status.is_open());
        if step_open {
            let released = self.release_stalled(&instance, &chunks, now).await?;
            return self.requeue_orphaned(&instance, &chunks, released, now).await;
        }

        let definition = self.registry.get(&instance.job_definition_id)?;
        if instance.current_step_index < definition.last_step_index() {
            let advanced = self.sequencer.try_advance(instance_id).await?;
            if advanced > 0 {
                info!(instance_id = %instance_id, advanced, "Advanced orphaned step");
                return Ok(CleanupAction::StepsAdvanced(advanced));
            }
            return Ok(CleanupAction::NoAction);
        }

        match (error_count, instance.status) {
            (0, _) => {
                self.transition(&instance, InstanceEvent::Complete, CleanupAction::Completed)
                    .await
            }
            (_, JobStatus::InProgress) => {
                self.transition(&instance, InstanceEvent::Error, CleanupAction::Errored)
                    .await
            }
            _ => Ok(CleanupAction::NoAction),
        }
    }

    async fn transition(
        &self,
        instance: &JobInstance,
        event: InstanceEvent,
        action: CleanupAction,
    ) -> BatchResult<CleanupAction> {
        match self
            .store
            .transition_status(instance.instance_id, instance.status, event)
            .await?
        {
            Some(updated) => {
                record_transition(&self.events, &updated, "cleanup_transition");
                Ok(action)
            }
            None => Ok(CleanupAction::NoAction),
        }
    }

    /// Return IN_PROGRESS chunks claimed at least `stalled_chunk_seconds` ago to
    /// PENDING. Yields the released chunks as the store left them.
    async fn release_stalled(
        &self,
        instance: &JobInstance,
        chunks: &[WorkChunk],
        now: DateTime<Utc>,
    ) -> BatchResult<Vec<WorkChunk>> {
        let mut released = Vec::new();
        let stalled = chunks.iter().filter(|c| {
            c.status == ChunkStatus::InProgress
                && c.start_time.map_or(true, |at| now - at >= self.stalled_after)
        });
        for chunk in stalled {
            if let Some(chunk) = self.store.release_chunk(chunk.chunk_id).await? {
                released.push(chunk);
            }
        }

        if !released.is_empty() {
            warn!(
                instance_id = %instance.instance_id,
                released = released.len(),
                "Released stalled chunks"
            );
        }
        Ok(released)
    }

    async fn requeue_orphaned(
        &self,
        instance: &JobInstance,
        chunks: &[WorkChunk],
        released: Vec<WorkChunk>,
        now: DateTime<Utc>,
    ) -> BatchResult<CleanupAction> {
        let released_count = released.len();
        let stale: Vec<WorkChunk> = chunks
            .iter()
            .filter(|c| {
                c.step_index == instance.current_step_index
                    && c.status == ChunkStatus::Pending
                    && c.enqueued_at.map_or(true, |at| now - at >= self.requeue_after)
            })
            .cloned()
            .chain(
                released
                    .into_iter()
                    .filter(|c| c.step_index == instance.current_step_index),
            )
            .collect();
        if stale.is_empty() {
            return Ok(match released_count {
                0 => CleanupAction::NoAction,
                count => CleanupAction::ChunksReleased(count),
            });
        }

        let chunk_ids: Vec<Uuid> = stale.iter().map(|c| c.chunk_id).collect();
        self.store
            .mark_chunks_enqueued(instance.instance_id, &chunk_ids, now)
            .await?;
        let requeued = self
            .queue
            .enqueue_all(stale.iter().map(|c| c.notification()))?;

        warn!(
            instance_id = %instance.instance_id,
            requeued,
            "Re-enqueued orphaned chunks"
        );
        Ok(CleanupAction::ChunksRequeued {
            requeued,
            released: released_count,
        })
    }

    async fn purge_expired(&self, instance: &JobInstance, now: DateTime<Utc>) -> usize {
        let expired = instance
            .end_time
            .map_or(false, |end| now - end >= self.retention);
        if !expired {
            return 0;
        }

        match self.store.purge_chunks(instance.instance_id).await {
            Ok(purged) => {
                if purged > 0 {
                    debug!(
                        instance_id = %instance.instance_id,
                        purged,
                        "Purged chunks of terminal instance"
                    );
                }
                purged
            }
            Err(e) => {
                warn!(instance_id = %instance.instance_id, error = %e, "Chunk purge failed");
                0
            }
        }
    }
}
