//! # OpenTelemetry Metrics
//!
//! Counters and histograms for instance lifecycle, chunk execution and
//! cleanup passes, recorded through the global meter provider. The crate does
//! not install an exporter; without one the instruments are no-ops.
//!
//! ```rust
//! use tasker_batch::metrics;
//! use opentelemetry::KeyValue;
//!
//! metrics::chunk_executions_total().add(1, &[KeyValue::new("step_id", "fetch-files")]);
//! ```

use opentelemetry::metrics::{Counter, Histogram, Meter};
use std::sync::OnceLock;

static BATCH_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    BATCH_METER.get_or_init(|| opentelemetry::global::meter("tasker-batch"))
}

/// Instances accepted by `start_instance`
///
/// Labels:
/// - job_definition_id
pub fn instances_started_total() -> Counter<u64> {
    meter()
        .u64_counter("tasker.batch.instances.started.total")
        .with_description("Total number of job instances started")
        .build()
}

/// Instances reaching COMPLETED, FAILED, CANCELLED or ERRORED
///
/// Labels:
/// - job_definition_id
/// - status
pub fn instance_transitions_total() -> Counter<u64> {
    meter()
        .u64_counter("tasker.batch.instances.transitions.total")
        .with_description("Total number of job instance status transitions")
        .build()
}

/// Chunks executed by workers
///
/// Labels:
/// - step_id
pub fn chunk_executions_total() -> Counter<u64> {
    meter()
        .u64_counter("tasker.batch.chunks.executions.total")
        .with_description("Total number of chunk executions attempted")
        .build()
}

/// Chunks that failed
///
/// Labels:
/// - step_id
/// - fatal: true, false
pub fn chunk_failures_total() -> Counter<u64> {
    meter()
        .u64_counter("tasker.batch.chunks.failures.total")
        .with_description("Total number of chunk executions that failed")
        .build()
}

/// Chunk execution duration in milliseconds
///
/// Labels:
/// - step_id
/// - result: success, error
pub fn chunk_execution_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("tasker.batch.chunks.execution.duration")
        .with_description("Chunk execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Cleanup pass duration in milliseconds
pub fn cleanup_pass_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("tasker.batch.cleanup.duration")
        .with_description("Cleanup pass duration in milliseconds")
        .with_unit("ms")
        .build()
}
