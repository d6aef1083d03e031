//! Shared bookkeeping for instance status changes: every component that moves
//! an instance calls [`record_transition`] so logs, metrics and events agree.

use crate::events::{EventPublisher, JobLifecycleEvent};
use crate::logging::log_instance_operation;
use crate::metrics;
use crate::models::JobInstance;
use opentelemetry::KeyValue;

/// Announce the status `instance` just entered
pub fn record_transition(events: &EventPublisher, instance: &JobInstance, operation: &str) {
    log_instance_operation(
        operation,
        Some(instance.instance_id),
        Some(&instance.job_definition_id),
        instance.status.as_str(),
        instance.error_message.as_deref(),
    );

    metrics::instance_transitions_total().add(
        1,
        &[
            KeyValue::new("job_definition_id", instance.job_definition_id.clone()),
            KeyValue::new("status", instance.status.as_str()),
        ],
    );

    if let Some(event) = JobLifecycleEvent::for_status(instance) {
        events.publish(event);
    }
}
