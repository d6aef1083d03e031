//! Worker pool for chunk execution
//!
//! A fixed number of tokio tasks share one [`ChunkQueue`]. Each worker waits
//! for a notification, hands it to the [`StepExecutor`] and records the
//! result in its own counters. On shutdown a worker finishes the chunk it is
//! executing and then exits; notifications still queued stay queued and their
//! chunks stay PENDING.

use crate::error::{BatchError, BatchResult};
use crate::execution::step_executor::{ChunkExecutionResult, StepExecutor};
use crate::queue::ChunkQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct WorkerStats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
}

impl WorkerStats {
    fn record(&self, result: &BatchResult<ChunkExecutionResult>) {
        match result {
            Ok(ChunkExecutionResult::Succeeded { .. }) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(ChunkExecutionResult::Failed { .. }) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(ChunkExecutionResult::Skipped) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self, worker_id: usize) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            worker_id,
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters of one worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub worker_id: usize,
    /// Chunks executed, successfully or not
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Notifications dropped at claim time
    pub skipped: u64,
    /// Store errors while executing
    pub errors: u64,
}

pub struct WorkerPool {
    executor: Arc<StepExecutor>,
    queue: Arc<ChunkQueue>,
    idle_poll: Duration,
    stats: Vec<Arc<WorkerStats>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.stats.len())
            .field("idle_poll", &self.idle_poll)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(
        executor: Arc<StepExecutor>,
        queue: Arc<ChunkQueue>,
        worker_count: usize,
        idle_poll: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            executor,
            queue,
            idle_poll,
            stats: (0..worker_count).map(|_| Arc::default()).collect(),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.stats.len()
    }

    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    /// Spawn the worker tasks on the current tokio runtime
    pub fn start(&self) -> BatchResult<()> {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return Err(BatchError::Internal("Worker pool already started".to_string()));
        }
        if *self.shutdown_tx.borrow() {
            return Err(BatchError::Internal("Worker pool has been shut down".to_string()));
        }

        info!("🔄 Starting worker pool with {} workers", self.stats.len());

        for (worker_id, stats) in self.stats.iter().enumerate() {
            let executor = Arc::clone(&self.executor);
            let queue = Arc::clone(&self.queue);
            let stats = Arc::clone(stats);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let idle_poll = self.idle_poll;

            handles.push(tokio::spawn(async move {
                run_worker(worker_id, executor, queue, stats, shutdown_rx, idle_poll).await;
            }));
        }
        Ok(())
    }

    /// Signal every worker to stop and wait for in-flight chunks to finish
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task terminated abnormally: {}", e);
            }
        }
        info!("✅ Worker pool stopped");
    }

    pub fn stats(&self) -> Vec<WorkerStatsSnapshot> {
        self.stats
            .iter()
            .enumerate()
            .map(|(worker_id, stats)| stats.snapshot(worker_id))
            .collect()
    }

    /// Counters summed over all workers
    pub fn total_stats(&self) -> WorkerStatsSnapshot {
        self.stats().into_iter().fold(
            WorkerStatsSnapshot::default(),
            |mut total, worker| {
                total.processed += worker.processed;
                total.succeeded += worker.succeeded;
                total.failed += worker.failed;
                total.skipped += worker.skipped;
                total.errors += worker.errors;
                total
            },
        )
    }
}

async fn run_worker(
    worker_id: usize,
    executor: Arc<StepExecutor>,
    queue: Arc<ChunkQueue>,
    stats: Arc<WorkerStats>,
    mut shutdown_rx: watch::Receiver<bool>,
    idle_poll: Duration,
) {
    debug!(worker_id = worker_id, "Worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let notification = tokio::select! {
            _ = shutdown_rx.changed() => break,
            notification = queue.dequeue_timeout(idle_poll) => notification,
        };

        let Some(notification) = notification else {
            if queue.is_closed() {
                break;
            }
            continue;
        };

        let result = executor.execute(notification).await;
        if let Err(e) = &result {
            warn!(
                worker_id = worker_id,
                instance_id = %notification.instance_id,
                chunk_id = %notification.chunk_id,
                error = %e,
                "Chunk execution failed"
            );
        }
        stats.record(&result);
    }

    debug!(worker_id = worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPublisher;
    use crate::execution::step_handler::{
        ChunkContext, FnStepHandler, StaticChunkProducer, StepOutcome,
    };
    use crate::models::{ChunkSource, JobDefinition, JobInstance, JobInstanceStartRequest, StepDefinition};
    use crate::orchestration::error_classifier::StandardErrorClassifier;
    use crate::orchestration::step_sequencer::StepSequencer;
    use crate::registry::JobDefinitionRegistry;
    use crate::store::{InMemoryJobInstanceStore, JobInstanceStore};
    use serde_json::json;

    #[tokio::test]
    async fn test_pool_executes_queued_chunks() {
        let definition = JobDefinition::new("job").with_step(StepDefinition::chunked(
            "work",
            ChunkSource::Parameters(Arc::new(StaticChunkProducer::new(
                (0..10).map(|i| json!(i)).collect(),
            ))),
            Arc::new(FnStepHandler::new(|_: &ChunkContext| Ok(StepOutcome::processed(1)))),
        ));
        let registry = Arc::new(
            JobDefinitionRegistry::builder()
                .register(definition)
                .build()
                .unwrap(),
        );
        let store = Arc::new(InMemoryJobInstanceStore::new());
        let queue = Arc::new(ChunkQueue::new());
        let events = EventPublisher::default();
        let sequencer = Arc::new(StepSequencer::new(
            registry.clone(),
            store.clone(),
            queue.clone(),
            events.clone(),
        ));
        let executor = Arc::new(StepExecutor::new(
            registry,
            store.clone(),
            sequencer.clone(),
            Arc::new(StandardErrorClassifier::new()),
            events,
        ));
        let pool = WorkerPool::new(executor, queue.clone(), 3, Duration::from_millis(10));

        pool.start().unwrap();
        assert!(pool.is_running());
        assert!(pool.start().is_err());

        let instance = JobInstance::new(&JobInstanceStartRequest::new("job"));
        let id = instance.instance_id;
        store.create_instance(instance).await.unwrap();
        sequencer.produce_first_step(id).await.unwrap();

        for _ in 0..200 {
            if pool.total_stats().processed == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;

        let total = pool.total_stats();
        assert_eq!(total.processed, 10);
        assert_eq!(total.succeeded, 10);
        assert_eq!(pool.stats().len(), 3);
        assert!(!pool.is_running());

        let instance = store.fetch_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.combined_records_processed, 10);
    }

    #[tokio::test]
    async fn test_shutdown_without_start_is_noop() {
        let registry = Arc::new(JobDefinitionRegistry::builder().build().unwrap());
        let store = Arc::new(InMemoryJobInstanceStore::new());
        let queue = Arc::new(ChunkQueue::new());
        let events = EventPublisher::default();
        let sequencer = Arc::new(StepSequencer::new(
            registry.clone(),
            store.clone(),
            queue.clone(),
            events.clone(),
        ));
        let executor = Arc::new(StepExecutor::new(
            registry,
            store,
            sequencer,
            Arc::new(StandardErrorClassifier::new()),
            events,
        ));
        let pool = WorkerPool::new(executor, queue, 2, Duration::from_millis(10));

        pool.shutdown().await;
        assert!(pool.start().is_err());
    }
}
