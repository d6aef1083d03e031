//! # Job Engine Bootstrap
//!
//! Wires the registry, store, chunk queue, worker pool, coordinator and
//! cleaner from a [`BatchConfig`] and owns their background tasks.
//!
//! ## Lifecycle
//!
//! - [`JobEngine::new`] builds every component; nothing runs yet
//! - [`JobEngine::start`] spawns the workers and the cleanup loop
//! - [`JobEngine::shutdown`] stops both, letting in-flight chunks finish
//!
//! ```rust,no_run
//! use tasker_batch::{BatchConfig, JobEngine, JobInstanceStartRequest};
//! use tasker_batch::jobs::bulk_import;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = tasker_batch::JobDefinitionRegistry::builder()
//!     .register(bulk_import::job_definition())
//!     .build()?;
//! let engine = JobEngine::new(BatchConfig::default(), registry)?;
//! engine.start()?;
//!
//! let id = engine
//!     .coordinator()
//!     .start_instance(
//!         JobInstanceStartRequest::new(bulk_import::JOB_DEFINITION_ID)
//!             .with_parameter(bulk_import::NDJSON_PATHS_PARAMETER, "/data/patients.ndjson"),
//!     )
//!     .await?;
//! let finished = engine.await_settled(id, std::time::Duration::from_secs(60)).await?;
//! println!("{}", finished.status);
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::config::BatchConfig;
use crate::error::{BatchError, BatchResult};
use crate::events::EventPublisher;
use crate::execution::{StepExecutor, WorkerPool};
use crate::models::JobInstance;
use crate::orchestration::coordinator::JobCoordinator;
use crate::orchestration::error_classifier::{ErrorClassifier, StandardErrorClassifier};
use crate::orchestration::job_cleaner::JobCleanerService;
use crate::orchestration::step_sequencer::StepSequencer;
use crate::queue::ChunkQueue;
use crate::registry::JobDefinitionRegistry;
use crate::state_machine::JobStatus;
use crate::store::{InMemoryJobInstanceStore, JobInstanceStore};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct JobEngine {
    config: BatchConfig,
    registry: Arc<JobDefinitionRegistry>,
    store: Arc<dyn JobInstanceStore>,
    queue: Arc<ChunkQueue>,
    events: EventPublisher,
    coordinator: Arc<JobCoordinator>,
    cleaner: Arc<JobCleanerService>,
    worker_pool: Arc<WorkerPool>,
    shutdown_tx: watch::Sender<bool>,
    cleaner_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for JobEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEngine")
            .field("config", &self.config)
            .field("worker_pool", &self.worker_pool)
            .finish_non_exhaustive()
    }
}

impl JobEngine {
    /// Engine backed by the in-memory store and the standard error classifier
    pub fn new(config: BatchConfig, registry: JobDefinitionRegistry) -> BatchResult<Self> {
        Self::with_components(
            config,
            registry,
            Arc::new(InMemoryJobInstanceStore::new()),
            Arc::new(StandardErrorClassifier::new()),
        )
    }

    pub fn with_components(
        config: BatchConfig,
        registry: JobDefinitionRegistry,
        store: Arc<dyn JobInstanceStore>,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> BatchResult<Self> {
        config.validate()?;

        let registry = Arc::new(registry);
        let queue = Arc::new(ChunkQueue::new());
        let events = EventPublisher::new(config.event_channel_capacity);

        let sequencer = Arc::new(StepSequencer::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&queue),
            events.clone(),
        ));
        let coordinator = Arc::new(JobCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&sequencer),
            events.clone(),
        ));
        let cleaner = Arc::new(JobCleanerService::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&sequencer),
            events.clone(),
            &config,
        ));
        let executor = Arc::new(StepExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            sequencer,
            classifier,
            events.clone(),
        ));
        let worker_pool = Arc::new(WorkerPool::new(
            executor,
            Arc::clone(&queue),
            config.worker_count,
            config.worker_idle_poll(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        let stats = registry.stats();
        info!(
            job_definitions = stats.total_definitions,
            worker_count = config.worker_count,
            "Job engine initialized"
        );

        Ok(Self {
            config,
            registry,
            store,
            queue,
            events,
            coordinator,
            cleaner,
            worker_pool,
            shutdown_tx,
            cleaner_handle: Mutex::new(None),
        })
    }

    /// Spawn the worker pool and the cleanup loop
    pub fn start(&self) -> BatchResult<()> {
        if *self.shutdown_tx.borrow() {
            return Err(BatchError::Internal("Job engine has been shut down".to_string()));
        }
        self.worker_pool.start()?;

        let cleaner = Arc::clone(&self.cleaner);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *self.cleaner_handle.lock() = Some(tokio::spawn(async move {
            cleaner.run(shutdown_rx).await;
        }));

        info!("🚀 Job engine started");
        Ok(())
    }

    /// Stop background work. Queued chunks stay PENDING.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.worker_pool.shutdown().await;
        self.queue.close();

        let handle = self.cleaner_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Cleaner task terminated abnormally: {}", e);
            }
        }
        info!("🛑 Job engine stopped");
    }

    /// Poll until the instance is COMPLETED, FAILED, CANCELLED or ERRORED
    pub async fn await_settled(&self, instance_id: Uuid, timeout: Duration) -> BatchResult<JobInstance> {
        match tokio::time::timeout(timeout, self.poll_until_settled(instance_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(instance_id = %instance_id, ?timeout, "Instance did not settle in time");
                Err(BatchError::Internal(format!(
                    "Instance {instance_id} did not settle within {timeout:?}"
                )))
            }
        }
    }

    async fn poll_until_settled(&self, instance_id: Uuid) -> BatchResult<JobInstance> {
        let poll = self.config.cleanup_interval().min(Duration::from_millis(50));
        loop {
            let instance = self.coordinator.get_instance(instance_id).await?;
            if instance.is_terminal() || instance.status == JobStatus::Errored {
                return Ok(instance);
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobDefinitionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn JobInstanceStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<ChunkQueue> {
        &self.queue
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn coordinator(&self) -> &Arc<JobCoordinator> {
        &self.coordinator
    }

    pub fn cleaner(&self) -> &Arc<JobCleanerService> {
        &self.cleaner
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.worker_pool
    }
}
