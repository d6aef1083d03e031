//! # Job Instance Store
//!
//! Single source of truth for instances and their chunks. Every mutation of an
//! instance's counters or status goes through this trait, and implementations
//! must serialize mutations per instance: counters are incremented atomically
//! together with the chunk update that contributes them, and status changes
//! are compare-and-update against the expected current status.
//!
//! Terminal instances are sticky: once COMPLETED, FAILED or CANCELLED, an
//! implementation must refuse further counter or status changes.

pub mod in_memory;

use crate::error::BatchResult;
use crate::execution::step_handler::StepOutcome;
use crate::models::{JobInstance, WorkChunk};
use crate::state_machine::{ChunkStatus, InstanceEvent, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

pub use in_memory::InMemoryJobInstanceStore;

/// Outcome of trying to claim a chunk for execution
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkClaim {
    Claimed {
        chunk: WorkChunk,
        instance: JobInstance,
        /// This claim moved the instance out of QUEUED
        started_instance: bool,
    },
    Skipped(ClaimSkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimSkipReason {
    /// Another worker already took it (duplicate delivery)
    NotPending(ChunkStatus),
    CancellationRequested,
    /// Instance failed or reached a terminal state
    InstanceNotDispatchable(JobStatus),
}

/// Instance state after a chunk was finalized
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCompletion {
    pub chunk: WorkChunk,
    pub instance: JobInstance,
    /// The chunk's step has no open chunks left and its production is complete
    pub step_drained: bool,
    /// This call moved the instance to FAILED
    pub instance_failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationOutcome {
    Requested,
    AlreadyRequested,
    AlreadyTerminal(JobStatus),
}

/// Instance and chunks read under one lock
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSnapshot {
    pub instance: JobInstance,
    pub chunks: Vec<WorkChunk>,
}

#[async_trait]
pub trait JobInstanceStore: Send + Sync {
    async fn create_instance(&self, instance: JobInstance) -> BatchResult<()>;

    async fn fetch_instance(&self, instance_id: Uuid) -> BatchResult<Option<JobInstance>>;

    async fn list_instances(&self) -> BatchResult<Vec<JobInstance>>;

    async fn snapshot(&self, instance_id: Uuid) -> BatchResult<Option<InstanceSnapshot>>;

    async fn request_cancellation(&self, instance_id: Uuid) -> BatchResult<CancellationOutcome>;

    /// Persist PENDING chunks for a step. Returns nothing for terminal instances.
    async fn create_chunks(
        &self,
        instance_id: Uuid,
        step_index: usize,
        step_id: &str,
        payloads: Vec<Value>,
    ) -> BatchResult<Vec<WorkChunk>>;

    async fn mark_chunks_enqueued(
        &self,
        instance_id: Uuid,
        chunk_ids: &[Uuid],
        at: DateTime<Utc>,
    ) -> BatchResult<()>;

    async fn fetch_chunks(&self, instance_id: Uuid) -> BatchResult<Vec<WorkChunk>>;

    /// PENDING -> IN_PROGRESS, moving a QUEUED instance to IN_PROGRESS on first dispatch
    async fn claim_chunk(&self, chunk_id: Uuid) -> BatchResult<ChunkClaim>;

    /// IN_PROGRESS -> SUCCESS, adding the record count to the instance counter
    async fn complete_chunk(&self, chunk_id: Uuid, outcome: StepOutcome)
        -> BatchResult<ChunkCompletion>;

    /// IN_PROGRESS -> FAILED, incrementing the error count; `fatal` also fails the instance
    async fn fail_chunk(
        &self,
        chunk_id: Uuid,
        message: String,
        fatal: bool,
    ) -> BatchResult<ChunkCompletion>;

    /// IN_PROGRESS -> PENDING without touching instance counters, so the chunk
    /// can be delivered again. Returns `None` when the chunk is no longer
    /// IN_PROGRESS.
    async fn release_chunk(&self, chunk_id: Uuid) -> BatchResult<Option<WorkChunk>>;

    /// Record an instance-level unrecoverable error and move to FAILED.
    /// Returns `None` when the instance was already terminal.
    async fn fail_instance(&self, instance_id: Uuid, message: String)
        -> BatchResult<Option<JobInstance>>;

    /// Apply `event` only if the instance is still in `expected`.
    /// Returns the updated instance, or `None` when the status moved on.
    async fn transition_status(
        &self,
        instance_id: Uuid,
        expected: JobStatus,
        event: InstanceEvent,
    ) -> BatchResult<Option<JobInstance>>;

    /// Raise counters to values recomputed from chunk state; never lowers them
    async fn reconcile_counters(
        &self,
        instance_id: Uuid,
        error_count: u64,
        records_processed: u64,
    ) -> BatchResult<bool>;

    async fn mark_step_production_complete(
        &self,
        instance_id: Uuid,
        step_index: usize,
    ) -> BatchResult<bool>;

    /// Move `current_step_index` from `from_step` to `from_step + 1` if that step
    /// is fully produced and drained. Exactly one caller wins.
    async fn advance_step(&self, instance_id: Uuid, from_step: usize) -> BatchResult<bool>;

    /// Drop chunk records of a terminal instance
    async fn purge_chunks(&self, instance_id: Uuid) -> BatchResult<usize>;
}
