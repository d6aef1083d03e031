use crate::models::JobInstance;
use crate::state_machine::JobStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Typed lifecycle notifications emitted by the coordinator, executors and cleaner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobLifecycleEvent {
    InstanceCreated {
        instance_id: Uuid,
        job_definition_id: String,
    },
    /// First chunk dispatched
    InstanceStarted { instance_id: Uuid },
    ChunkFailed {
        instance_id: Uuid,
        chunk_id: Uuid,
        step_id: String,
        error_message: String,
        fatal: bool,
    },
    StepAdvanced {
        instance_id: Uuid,
        step_index: usize,
        chunk_count: usize,
    },
    /// All work attempted, failures need operator attention
    InstanceErrored(JobInstance),
    CancellationRequested { instance_id: Uuid },
    /// COMPLETED, FAILED or CANCELLED
    InstanceTerminal(JobInstance),
}

impl JobLifecycleEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::InstanceCreated { .. } => "instance.created",
            Self::InstanceStarted { .. } => "instance.started",
            Self::ChunkFailed { .. } => "chunk.failed",
            Self::StepAdvanced { .. } => "step.advanced",
            Self::InstanceErrored(_) => "instance.errored",
            Self::CancellationRequested { .. } => "instance.cancellation_requested",
            Self::InstanceTerminal(_) => "instance.terminal",
        }
    }

    pub fn instance_id(&self) -> Uuid {
        match self {
            Self::InstanceCreated { instance_id, .. }
            | Self::InstanceStarted { instance_id }
            | Self::ChunkFailed { instance_id, .. }
            | Self::StepAdvanced { instance_id, .. }
            | Self::CancellationRequested { instance_id } => *instance_id,
            Self::InstanceErrored(instance) | Self::InstanceTerminal(instance) => {
                instance.instance_id
            }
        }
    }

    /// Build the event for a status an instance just entered, if any
    pub fn for_status(instance: &JobInstance) -> Option<Self> {
        match instance.status {
            JobStatus::InProgress => Some(Self::InstanceStarted {
                instance_id: instance.instance_id,
            }),
            JobStatus::Errored => Some(Self::InstanceErrored(instance.clone())),
            status if status.is_terminal() => Some(Self::InstanceTerminal(instance.clone())),
            _ => None,
        }
    }
}

/// High-throughput event publisher for lifecycle events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<JobLifecycleEvent>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: JobLifecycleEvent) {
        tracing::trace!(
            event = event.event_name(),
            instance_id = %event.instance_id(),
            "Publishing lifecycle event"
        );
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<JobLifecycleEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobInstanceStartRequest;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = EventPublisher::default();
        assert_eq!(publisher.subscriber_count(), 0);
        publisher.publish(JobLifecycleEvent::InstanceStarted {
            instance_id: Uuid::new_v4(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_typed_events() {
        let publisher = EventPublisher::new(16);
        let mut receiver = publisher.subscribe();
        let instance_id = Uuid::new_v4();

        publisher.publish(JobLifecycleEvent::CancellationRequested { instance_id });

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_name(), "instance.cancellation_requested");
        assert_eq!(event.instance_id(), instance_id);
    }

    #[test]
    fn test_for_status_mapping() {
        let mut instance = JobInstance::new(&JobInstanceStartRequest::new("job"));
        assert!(JobLifecycleEvent::for_status(&instance).is_none());

        instance.status = JobStatus::Completed;
        assert!(matches!(
            JobLifecycleEvent::for_status(&instance),
            Some(JobLifecycleEvent::InstanceTerminal(_))
        ));

        instance.status = JobStatus::Errored;
        assert!(matches!(
            JobLifecycleEvent::for_status(&instance),
            Some(JobLifecycleEvent::InstanceErrored(_))
        ));
    }
}
