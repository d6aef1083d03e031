//! In-memory [`JobInstanceStore`].
//!
//! Instances live in a `DashMap`, each behind its own `parking_lot::Mutex`
//! together with its chunks, so a chunk update and the counter change it
//! causes are applied under one lock. Locks are never held across `.await`.

use super::{
    CancellationOutcome, ChunkClaim, ChunkCompletion, ClaimSkipReason, InstanceSnapshot,
    JobInstanceStore,
};
use crate::error::{BatchError, BatchResult};
use crate::execution::step_handler::StepOutcome;
use crate::models::{JobInstance, WorkChunk};
use crate::state_machine::{ChunkStatus, InstanceEvent, InstanceStateMachine, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug)]
struct InstanceEntry {
    instance: JobInstance,
    chunks: Vec<WorkChunk>,
    positions: HashMap<Uuid, usize>,
}

impl InstanceEntry {
    fn chunk_mut(&mut self, chunk_id: Uuid) -> BatchResult<&mut WorkChunk> {
        let position = *self
            .positions
            .get(&chunk_id)
            .ok_or(BatchError::ChunkNotFound(chunk_id))?;
        Ok(&mut self.chunks[position])
    }

    fn step_drained(&self, step_index: usize) -> bool {
        self.instance.current_step_index == step_index
            && self.instance.step_production_complete
            && !self
                .chunks
                .iter()
                .any(|c| c.step_index == step_index && c.status.is_open())
    }

    /// Apply a transition through the state machine; false if it is not allowed
    fn apply_event(&mut self, event: &InstanceEvent, now: DateTime<Utc>) -> bool {
        match InstanceStateMachine::new().determine_target_state(self.instance.status, event) {
            Ok(target) => {
                self.instance.apply_status(target, now);
                true
            }
            Err(e) => {
                debug!(
                    instance_id = %self.instance.instance_id,
                    error = %e,
                    "Transition not applied"
                );
                false
            }
        }
    }

    fn record_error(&mut self, message: String) {
        self.instance.error_count += 1;
        self.instance.error_message = Some(message);
    }
}

#[derive(Debug, Default)]
pub struct InMemoryJobInstanceStore {
    instances: DashMap<Uuid, Arc<Mutex<InstanceEntry>>>,
    chunk_owners: DashMap<Uuid, Uuid>,
}

impl InMemoryJobInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, instance_id: Uuid) -> BatchResult<Arc<Mutex<InstanceEntry>>> {
        self.instances
            .get(&instance_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(BatchError::InstanceNotFound(instance_id))
    }

    fn entry_for_chunk(&self, chunk_id: Uuid) -> BatchResult<Arc<Mutex<InstanceEntry>>> {
        let instance_id = self
            .chunk_owners
            .get(&chunk_id)
            .map(|e| *e.value())
            .ok_or(BatchError::ChunkNotFound(chunk_id))?;
        self.entry(instance_id)
    }

    fn finalize_chunk(
        &self,
        chunk_id: Uuid,
        apply: impl FnOnce(&mut InstanceEntry, usize) -> BatchResult<bool>,
    ) -> BatchResult<ChunkCompletion> {
        let entry = self.entry_for_chunk(chunk_id)?;
        let mut guard = entry.lock();

        let chunk = guard.chunk_mut(chunk_id)?;
        if chunk.status != ChunkStatus::InProgress {
            return Err(BatchError::StateTransitionError(format!(
                "Chunk {chunk_id} is {} and cannot be finalized",
                chunk.status
            )));
        }
        let step_index = chunk.step_index;

        let instance_failed = apply(&mut *guard, step_index)?;
        let chunk = guard.chunk_mut(chunk_id)?.clone();

        Ok(ChunkCompletion {
            step_drained: guard.step_drained(step_index),
            instance: guard.instance.clone(),
            chunk,
            instance_failed,
        })
    }
}

#[async_trait]
impl JobInstanceStore for InMemoryJobInstanceStore {
    async fn create_instance(&self, instance: JobInstance) -> BatchResult<()> {
        let instance_id = instance.instance_id;
        if self.instances.contains_key(&instance_id) {
            return Err(BatchError::StoreError(format!(
                "Instance {instance_id} already exists"
            )));
        }
        self.instances.insert(
            instance_id,
            Arc::new(Mutex::new(InstanceEntry {
                instance,
                chunks: Vec::new(),
                positions: HashMap::new(),
            })),
        );
        Ok(())
    }

    async fn fetch_instance(&self, instance_id: Uuid) -> BatchResult<Option<JobInstance>> {
        Ok(self
            .instances
            .get(&instance_id)
            .map(|e| e.value().lock().instance.clone()))
    }

    async fn list_instances(&self) -> BatchResult<Vec<JobInstance>> {
        let entries: Vec<Arc<Mutex<InstanceEntry>>> =
            self.instances.iter().map(|e| Arc::clone(e.value())).collect();
        let mut instances: Vec<JobInstance> =
            entries.iter().map(|e| e.lock().instance.clone()).collect();
        instances.sort_by_key(|i| i.create_time);
        Ok(instances)
    }

    async fn snapshot(&self, instance_id: Uuid) -> BatchResult<Option<InstanceSnapshot>> {
        let Some(entry) = self.instances.get(&instance_id).map(|e| Arc::clone(e.value())) else {
            return Ok(None);
        };
        let guard = entry.lock();
        Ok(Some(InstanceSnapshot {
            instance: guard.instance.clone(),
            chunks: guard.chunks.clone(),
        }))
    }

    async fn request_cancellation(&self, instance_id: Uuid) -> BatchResult<CancellationOutcome> {
        let entry = self.entry(instance_id)?;
        let mut guard = entry.lock();

        if guard.instance.is_terminal() {
            return Ok(CancellationOutcome::AlreadyTerminal(guard.instance.status));
        }
        if guard.instance.cancel_requested {
            return Ok(CancellationOutcome::AlreadyRequested);
        }
        guard.instance.cancel_requested = true;
        Ok(CancellationOutcome::Requested)
    }

    async fn create_chunks(
        &self,
        instance_id: Uuid,
        step_index: usize,
        step_id: &str,
        payloads: Vec<Value>,
    ) -> BatchResult<Vec<WorkChunk>> {
        let entry = self.entry(instance_id)?;
        let mut guard = entry.lock();

        if guard.instance.is_terminal() {
            return Ok(Vec::new());
        }

        let mut created = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let chunk = WorkChunk::new(instance_id, step_index, step_id, payload);
            let position = guard.chunks.len();
            guard.positions.insert(chunk.chunk_id, position);
            self.chunk_owners.insert(chunk.chunk_id, instance_id);
            guard.chunks.push(chunk.clone());
            created.push(chunk);
        }
        Ok(created)
    }

    async fn mark_chunks_enqueued(
        &self,
        instance_id: Uuid,
        chunk_ids: &[Uuid],
        at: DateTime<Utc>,
    ) -> BatchResult<()> {
        let entry = self.entry(instance_id)?;
        let mut guard = entry.lock();
        for chunk_id in chunk_ids {
            guard.chunk_mut(*chunk_id)?.enqueued_at = Some(at);
        }
        Ok(())
    }

    async fn fetch_chunks(&self, instance_id: Uuid) -> BatchResult<Vec<WorkChunk>> {
        let entry = self.entry(instance_id)?;
        let chunks = entry.lock().chunks.clone();
        Ok(chunks)
    }

    async fn claim_chunk(&self, chunk_id: Uuid) -> BatchResult<ChunkClaim> {
        let entry = self.entry_for_chunk(chunk_id)?;
        let mut guard = entry.lock();
        let now = Utc::now();

        let status = guard.chunk_mut(chunk_id)?.status;
        if status != ChunkStatus::Pending {
            return Ok(ChunkClaim::Skipped(ClaimSkipReason::NotPending(status)));
        }
        if guard.instance.cancel_requested {
            return Ok(ChunkClaim::Skipped(ClaimSkipReason::CancellationRequested));
        }
        if !guard.instance.accepts_dispatch() {
            return Ok(ChunkClaim::Skipped(
                ClaimSkipReason::InstanceNotDispatchable(guard.instance.status),
            ));
        }

        let started_instance = guard.instance.status == JobStatus::Queued
            && guard.apply_event(&InstanceEvent::Start, now);

        let chunk = guard.chunk_mut(chunk_id)?;
        chunk.status = ChunkStatus::InProgress;
        chunk.start_time = Some(now);
        let chunk = chunk.clone();

        Ok(ChunkClaim::Claimed {
            chunk,
            instance: guard.instance.clone(),
            started_instance,
        })
    }

    async fn complete_chunk(
        &self,
        chunk_id: Uuid,
        outcome: StepOutcome,
    ) -> BatchResult<ChunkCompletion> {
        self.finalize_chunk(chunk_id, |entry, _| {
            let now = Utc::now();
            let chunk = entry.chunk_mut(chunk_id)?;
            chunk.status = ChunkStatus::Success;
            chunk.records_processed = outcome.records_processed;
            chunk.emitted = outcome.emitted;
            chunk.end_time = Some(now);

            if !entry.instance.is_terminal() {
                entry.instance.combined_records_processed += outcome.records_processed;
            }
            Ok(false)
        })
    }

    async fn fail_chunk(
        &self,
        chunk_id: Uuid,
        message: String,
        fatal: bool,
    ) -> BatchResult<ChunkCompletion> {
        self.finalize_chunk(chunk_id, |entry, _| {
            let now = Utc::now();
            let chunk = entry.chunk_mut(chunk_id)?;
            chunk.status = ChunkStatus::Failed;
            chunk.error_message = Some(message.clone());
            chunk.end_time = Some(now);

            if entry.instance.is_terminal() {
                return Ok(false);
            }

            entry.record_error(message.clone());
            if fatal {
                entry.instance.fatal_error = true;
                return Ok(entry.apply_event(&InstanceEvent::Fail(message), now));
            }
            Ok(false)
        })
    }

    async fn release_chunk(&self, chunk_id: Uuid) -> BatchResult<Option<WorkChunk>> {
        let entry = self.entry_for_chunk(chunk_id)?;
        let mut guard = entry.lock();

        let chunk = guard.chunk_mut(chunk_id)?;
        if chunk.status != ChunkStatus::InProgress {
            return Ok(None);
        }
        chunk.status = ChunkStatus::Pending;
        chunk.start_time = None;
        chunk.enqueued_at = None;
        Ok(Some(chunk.clone()))
    }

    async fn fail_instance(
        &self,
        instance_id: Uuid,
        message: String,
    ) -> BatchResult<Option<JobInstance>> {
        let entry = self.entry(instance_id)?;
        let mut guard = entry.lock();

        if guard.instance.is_terminal() {
            return Ok(None);
        }
        guard.record_error(message.clone());
        guard.instance.fatal_error = true;
        if guard.apply_event(&InstanceEvent::Fail(message), Utc::now()) {
            Ok(Some(guard.instance.clone()))
        } else {
            Ok(None)
        }
    }

    async fn transition_status(
        &self,
        instance_id: Uuid,
        expected: JobStatus,
        event: InstanceEvent,
    ) -> BatchResult<Option<JobInstance>> {
        let entry = self.entry(instance_id)?;
        let mut guard = entry.lock();

        if guard.instance.status != expected {
            return Ok(None);
        }
        if guard.apply_event(&event, Utc::now()) {
            Ok(Some(guard.instance.clone()))
        } else {
            Ok(None)
        }
    }

    async fn reconcile_counters(
        &self,
        instance_id: Uuid,
        error_count: u64,
        records_processed: u64,
    ) -> BatchResult<bool> {
        let entry = self.entry(instance_id)?;
        let mut guard = entry.lock();

        if guard.instance.is_terminal() {
            return Ok(false);
        }

        let mut changed = false;
        if error_count > guard.instance.error_count {
            warn!(
                instance_id = %instance_id,
                stored = guard.instance.error_count,
                recomputed = error_count,
                "Error count behind chunk state, reconciling"
            );
            guard.instance.error_count = error_count;
            changed = true;
        }
        if records_processed > guard.instance.combined_records_processed {
            guard.instance.combined_records_processed = records_processed;
            changed = true;
        }
        Ok(changed)
    }

    async fn mark_step_production_complete(
        &self,
        instance_id: Uuid,
        step_index: usize,
    ) -> BatchResult<bool> {
        let entry = self.entry(instance_id)?;
        let mut guard = entry.lock();

        if guard.instance.current_step_index != step_index || guard.instance.step_production_complete
        {
            return Ok(false);
        }
        guard.instance.step_production_complete = true;
        Ok(true)
    }

    async fn advance_step(&self, instance_id: Uuid, from_step: usize) -> BatchResult<bool> {
        let entry = self.entry(instance_id)?;
        let mut guard = entry.lock();

        if !guard.instance.accepts_dispatch() || !guard.step_drained(from_step) {
            return Ok(false);
        }
        guard.instance.current_step_index = from_step + 1;
        guard.instance.step_production_complete = false;
        Ok(true)
    }

    async fn purge_chunks(&self, instance_id: Uuid) -> BatchResult<usize> {
        let entry = self.entry(instance_id)?;
        let mut guard = entry.lock();

        if !guard.instance.is_terminal() {
            return Err(BatchError::StateTransitionError(format!(
                "Instance {instance_id} is {} and its chunks are still needed",
                guard.instance.status
            )));
        }

        let purged = guard.chunks.len();
        for chunk in guard.chunks.drain(..) {
            self.chunk_owners.remove(&chunk.chunk_id);
        }
        guard.positions.clear();
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkTally, JobInstanceStartRequest};
    use serde_json::json;

    async fn store_with_instance() -> (InMemoryJobInstanceStore, Uuid) {
        let store = InMemoryJobInstanceStore::new();
        let instance = JobInstance::new(&JobInstanceStartRequest::new("job"));
        let id = instance.instance_id;
        store.create_instance(instance).await.unwrap();
        (store, id)
    }

    async fn produce(store: &InMemoryJobInstanceStore, id: Uuid, count: usize) -> Vec<WorkChunk> {
        let payloads = (0..count).map(|i| json!(i)).collect();
        let chunks = store.create_chunks(id, 0, "step", payloads).await.unwrap();
        store.mark_step_production_complete(id, 0).await.unwrap();
        chunks
    }

    #[tokio::test]
    async fn test_claim_starts_instance_once() {
        let (store, id) = store_with_instance().await;
        let chunks = produce(&store, id, 2).await;

        match store.claim_chunk(chunks[0].chunk_id).await.unwrap() {
            ChunkClaim::Claimed {
                started_instance,
                instance,
                ..
            } => {
                assert!(started_instance);
                assert_eq!(instance.status, JobStatus::InProgress);
                assert!(instance.start_time.is_some());
            }
            other => panic!("unexpected claim {other:?}"),
        }

        match store.claim_chunk(chunks[1].chunk_id).await.unwrap() {
            ChunkClaim::Claimed {
                started_instance, ..
            } => assert!(!started_instance),
            other => panic!("unexpected claim {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_claim_is_skipped() {
        let (store, id) = store_with_instance().await;
        let chunks = produce(&store, id, 1).await;

        store.claim_chunk(chunks[0].chunk_id).await.unwrap();
        assert_eq!(
            store.claim_chunk(chunks[0].chunk_id).await.unwrap(),
            ChunkClaim::Skipped(ClaimSkipReason::NotPending(ChunkStatus::InProgress))
        );
    }

    #[tokio::test]
    async fn test_release_returns_claimed_chunk_to_pending() {
        let (store, id) = store_with_instance().await;
        let chunks = produce(&store, id, 1).await;
        let chunk_id = chunks[0].chunk_id;
        store
            .mark_chunks_enqueued(id, &[chunk_id], Utc::now())
            .await
            .unwrap();
        store.claim_chunk(chunk_id).await.unwrap();

        let released = store.release_chunk(chunk_id).await.unwrap().unwrap();
        assert_eq!(released.status, ChunkStatus::Pending);
        assert!(released.start_time.is_none());
        assert!(released.enqueued_at.is_none());

        let snapshot = store.snapshot(id).await.unwrap().unwrap();
        let tally = ChunkTally::from_chunks(&snapshot.chunks);
        assert_eq!((tally.pending, tally.in_progress), (1, 0));
        assert_eq!(snapshot.instance.error_count, 0);

        // Already PENDING, nothing to release
        assert!(store.release_chunk(chunk_id).await.unwrap().is_none());

        assert!(matches!(
            store.claim_chunk(chunk_id).await.unwrap(),
            ChunkClaim::Claimed { .. }
        ));
    }

    #[tokio::test]
    async fn test_complete_and_fail_update_counters() {
        let (store, id) = store_with_instance().await;
        let chunks = produce(&store, id, 2).await;
        for chunk in &chunks {
            store.claim_chunk(chunk.chunk_id).await.unwrap();
        }

        let done = store
            .complete_chunk(chunks[0].chunk_id, StepOutcome::processed(5))
            .await
            .unwrap();
        assert_eq!(done.instance.combined_records_processed, 5);
        assert!(!done.step_drained);

        let failed = store
            .fail_chunk(chunks[1].chunk_id, "bad row".to_string(), false)
            .await
            .unwrap();
        assert_eq!(failed.instance.error_count, 1);
        assert_eq!(failed.instance.error_message.as_deref(), Some("bad row"));
        assert!(failed.step_drained);
        assert!(!failed.instance_failed);
        assert_eq!(failed.instance.status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn test_fatal_failure_is_sticky() {
        let (store, id) = store_with_instance().await;
        let chunks = produce(&store, id, 2).await;
        for chunk in &chunks {
            store.claim_chunk(chunk.chunk_id).await.unwrap();
        }

        let failed = store
            .fail_chunk(chunks[0].chunk_id, "corrupt".to_string(), true)
            .await
            .unwrap();
        assert!(failed.instance_failed);
        assert_eq!(failed.instance.status, JobStatus::Failed);
        assert!(failed.instance.end_time.is_some());

        // Late sibling completion must not touch the terminal instance
        let late = store
            .fail_chunk(chunks[1].chunk_id, "late".to_string(), false)
            .await
            .unwrap();
        assert_eq!(late.instance.error_count, 1);
        assert_eq!(late.instance.error_message.as_deref(), Some("corrupt"));
        assert_eq!(late.chunk.status, ChunkStatus::Failed);
    }

    #[tokio::test]
    async fn test_claim_refused_after_cancellation() {
        let (store, id) = store_with_instance().await;
        let chunks = produce(&store, id, 1).await;

        assert_eq!(
            store.request_cancellation(id).await.unwrap(),
            CancellationOutcome::Requested
        );
        assert_eq!(
            store.request_cancellation(id).await.unwrap(),
            CancellationOutcome::AlreadyRequested
        );
        assert_eq!(
            store.claim_chunk(chunks[0].chunk_id).await.unwrap(),
            ChunkClaim::Skipped(ClaimSkipReason::CancellationRequested)
        );
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_update() {
        let (store, id) = store_with_instance().await;

        assert!(store
            .transition_status(id, JobStatus::InProgress, InstanceEvent::Complete)
            .await
            .unwrap()
            .is_none());

        let completed = store
            .transition_status(id, JobStatus::Queued, InstanceEvent::Complete)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert!(completed.start_time.unwrap() <= completed.end_time.unwrap());

        assert!(store
            .transition_status(id, JobStatus::Completed, InstanceEvent::Cancel)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_advance_step_exactly_once() {
        let (store, id) = store_with_instance().await;
        let chunks = produce(&store, id, 1).await;

        assert!(!store.advance_step(id, 0).await.unwrap());

        store.claim_chunk(chunks[0].chunk_id).await.unwrap();
        store
            .complete_chunk(chunks[0].chunk_id, StepOutcome::processed(1))
            .await
            .unwrap();

        assert!(store.advance_step(id, 0).await.unwrap());
        assert!(!store.advance_step(id, 0).await.unwrap());

        let instance = store.fetch_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.current_step_index, 1);
        assert!(!instance.step_production_complete);
    }

    #[tokio::test]
    async fn test_reconcile_never_lowers_counters() {
        let (store, id) = store_with_instance().await;
        assert!(store.reconcile_counters(id, 2, 10).await.unwrap());
        assert!(!store.reconcile_counters(id, 1, 5).await.unwrap());

        let instance = store.fetch_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.error_count, 2);
        assert_eq!(instance.combined_records_processed, 10);
    }

    #[tokio::test]
    async fn test_purge_requires_terminal_instance() {
        let (store, id) = store_with_instance().await;
        let chunks = produce(&store, id, 3).await;

        assert!(store.purge_chunks(id).await.is_err());

        store.fail_instance(id, "abort".to_string()).await.unwrap();
        assert_eq!(store.purge_chunks(id).await.unwrap(), 3);
        assert!(store.fetch_chunks(id).await.unwrap().is_empty());
        assert_eq!(
            store.claim_chunk(chunks[0].chunk_id).await.unwrap_err(),
            BatchError::ChunkNotFound(chunks[0].chunk_id)
        );
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let store = InMemoryJobInstanceStore::new();
        let id = Uuid::new_v4();
        assert!(store.fetch_instance(id).await.unwrap().is_none());
        assert_eq!(
            store.request_cancellation(id).await.unwrap_err(),
            BatchError::InstanceNotFound(id)
        );
    }
}
