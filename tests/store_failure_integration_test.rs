//! Engine behavior when the store rejects a chunk outcome after the chunk was claimed

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{fast_config, items_request, scripted_job, ScriptedHandler, SETTLE_TIMEOUT};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tasker_batch::state_machine::InstanceEvent;
use tasker_batch::store::{
    CancellationOutcome, ChunkClaim, ChunkCompletion, InstanceSnapshot,
};
use tasker_batch::{
    BatchError, BatchResult, ChunkStatus, InMemoryJobInstanceStore, JobDefinitionRegistry,
    JobEngine, JobInstance, JobInstanceStore, JobStatus, StandardErrorClassifier, StepOutcome,
    WorkChunk,
};
use uuid::Uuid;

/// In-memory store whose `complete_chunk` fails a set number of times
struct FlakyStore {
    inner: InMemoryJobInstanceStore,
    failures_left: AtomicUsize,
    failures: AtomicUsize,
}

impl FlakyStore {
    fn failing(times: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryJobInstanceStore::new(),
            failures_left: AtomicUsize::new(times),
            failures: AtomicUsize::new(0),
        })
    }

    fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn heal(&self) {
        self.failures_left.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobInstanceStore for FlakyStore {
    async fn create_instance(&self, instance: JobInstance) -> BatchResult<()> {
        self.inner.create_instance(instance).await
    }

    async fn fetch_instance(&self, instance_id: Uuid) -> BatchResult<Option<JobInstance>> {
        self.inner.fetch_instance(instance_id).await
    }

    async fn list_instances(&self) -> BatchResult<Vec<JobInstance>> {
        self.inner.list_instances().await
    }

    async fn snapshot(&self, instance_id: Uuid) -> BatchResult<Option<InstanceSnapshot>> {
        self.inner.snapshot(instance_id).await
    }

    async fn request_cancellation(&self, instance_id: Uuid) -> BatchResult<CancellationOutcome> {
        self.inner.request_cancellation(instance_id).await
    }

    async fn create_chunks(
        &self,
        instance_id: Uuid,
        step_index: usize,
        step_id: &str,
        payloads: Vec<Value>,
    ) -> BatchResult<Vec<WorkChunk>> {
        self.inner
            .create_chunks(instance_id, step_index, step_id, payloads)
            .await
    }

    async fn mark_chunks_enqueued(
        &self,
        instance_id: Uuid,
        chunk_ids: &[Uuid],
        at: DateTime<Utc>,
    ) -> BatchResult<()> {
        self.inner.mark_chunks_enqueued(instance_id, chunk_ids, at).await
    }

    async fn fetch_chunks(&self, instance_id: Uuid) -> BatchResult<Vec<WorkChunk>> {
        self.inner.fetch_chunks(instance_id).await
    }

    async fn claim_chunk(&self, chunk_id: Uuid) -> BatchResult<ChunkClaim> {
        self.inner.claim_chunk(chunk_id).await
    }

    async fn complete_chunk(
        &self,
        chunk_id: Uuid,
        outcome: StepOutcome,
    ) -> BatchResult<ChunkCompletion> {
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(BatchError::StoreError("connection reset".to_string()));
        }
        self.inner.complete_chunk(chunk_id, outcome).await
    }

    async fn fail_chunk(
        &self,
        chunk_id: Uuid,
        message: String,
        fatal: bool,
    ) -> BatchResult<ChunkCompletion> {
        self.inner.fail_chunk(chunk_id, message, fatal).await
    }

    async fn release_chunk(&self, chunk_id: Uuid) -> BatchResult<Option<WorkChunk>> {
        self.inner.release_chunk(chunk_id).await
    }

    async fn fail_instance(
        &self,
        instance_id: Uuid,
        message: String,
    ) -> BatchResult<Option<JobInstance>> {
        self.inner.fail_instance(instance_id, message).await
    }

    async fn transition_status(
        &self,
        instance_id: Uuid,
        expected: JobStatus,
        event: InstanceEvent,
    ) -> BatchResult<Option<JobInstance>> {
        self.inner
            .transition_status(instance_id, expected, event)
            .await
    }

    async fn reconcile_counters(
        &self,
        instance_id: Uuid,
        error_count: u64,
        records_processed: u64,
    ) -> BatchResult<bool> {
        self.inner
            .reconcile_counters(instance_id, error_count, records_processed)
            .await
    }

    async fn mark_step_production_complete(
        &self,
        instance_id: Uuid,
        step_index: usize,
    ) -> BatchResult<bool> {
        self.inner
            .mark_step_production_complete(instance_id, step_index)
            .await
    }

    async fn advance_step(&self, instance_id: Uuid, from_step: usize) -> BatchResult<bool> {
        self.inner.advance_step(instance_id, from_step).await
    }

    async fn purge_chunks(&self, instance_id: Uuid) -> BatchResult<usize> {
        self.inner.purge_chunks(instance_id).await
    }
}

fn engine_over(store: Arc<FlakyStore>, handler: Arc<ScriptedHandler>) -> JobEngine {
    let registry = JobDefinitionRegistry::builder()
        .register(scripted_job("flaky", handler))
        .build()
        .expect("registry should build");
    let engine = JobEngine::with_components(
        fast_config(),
        registry,
        store,
        Arc::new(StandardErrorClassifier::new()),
    )
    .expect("engine should build");
    engine.start().expect("engine should start");
    engine
}

#[tokio::test]
async fn test_rejected_outcome_is_redelivered_and_instance_completes() {
    let store = FlakyStore::failing(1);
    let engine = engine_over(store.clone(), ScriptedHandler::new());

    let id = engine
        .coordinator()
        .start_instance(items_request("flaky", &["ok:1", "ok:1"]))
        .await
        .unwrap();
    let instance = engine.await_settled(id, SETTLE_TIMEOUT).await.unwrap();

    assert_eq!(store.failures(), 1);
    assert_eq!(instance.status, JobStatus::Completed);
    assert_eq!(instance.combined_records_processed, 2);
    assert_eq!(instance.error_count, 0);

    let chunks = engine.coordinator().get_chunks(id).await.unwrap();
    assert!(chunks.iter().all(|c| c.status == ChunkStatus::Success));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_settles_while_outcomes_are_rejected() {
    let store = FlakyStore::failing(usize::MAX);
    let engine = engine_over(store.clone(), ScriptedHandler::new());

    let id = engine
        .coordinator()
        .start_instance(items_request("flaky", &["ok:1", "ok:1"]))
        .await
        .unwrap();
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while store.failures() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("a chunk outcome should be rejected");

    engine.coordinator().cancel_instance(id).await.unwrap();
    let instance = engine.await_settled(id, SETTLE_TIMEOUT).await.unwrap();
    store.heal();

    assert_eq!(instance.status, JobStatus::Cancelled);
    assert!(instance.end_time.is_some());
    assert_eq!(instance.combined_records_processed, 0);

    let chunks = engine.coordinator().get_chunks(id).await.unwrap();
    assert!(chunks.iter().all(|c| c.status == ChunkStatus::Pending));

    engine.shutdown().await;
}
