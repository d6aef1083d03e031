use crate::state_machine::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Request to start a job instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInstanceStartRequest {
    pub job_definition_id: String,
    pub parameters: HashMap<String, String>,
}

impl JobInstanceStartRequest {
    pub fn new(job_definition_id: impl Into<String>) -> Self {
        Self {
            job_definition_id: job_definition_id.into(),
            parameters: HashMap::new(),
        }
    }

    /// Add a parameter; a later value for the same key replaces the earlier one
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// One execution of a job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInstance {
    pub instance_id: Uuid,
    pub job_definition_id: String,
    pub parameters: HashMap<String, String>,
    pub status: JobStatus,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub combined_records_processed: u64,
    /// Derived on read, see [`JobInstance::with_derived_metrics`]
    pub combined_records_processed_per_second: f64,
    pub error_count: u64,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    /// Set when an unrecoverable error was recorded
    pub fatal_error: bool,
    pub current_step_index: usize,
    /// All chunks of `current_step_index` have been created and enqueued
    pub step_production_complete: bool,
}

impl JobInstance {
    pub fn new(request: &JobInstanceStartRequest) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            job_definition_id: request.job_definition_id.clone(),
            parameters: request.parameters.clone(),
            status: JobStatus::Queued,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            combined_records_processed: 0,
            combined_records_processed_per_second: 0.0,
            error_count: 0,
            error_message: None,
            cancel_requested: false,
            fatal_error: false,
            current_step_index: 0,
            step_production_complete: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether workers may start new chunks of this instance
    pub fn accepts_dispatch(&self) -> bool {
        self.status.accepts_dispatch() && !self.cancel_requested && !self.fatal_error
    }

    /// `records / max(1s, now - start_time)`; zero before the first dispatch
    pub fn records_per_second_at(&self, now: DateTime<Utc>) -> f64 {
        match self.start_time {
            Some(start) => {
                let elapsed = (now - start).num_milliseconds() as f64 / 1000.0;
                self.combined_records_processed as f64 / elapsed.max(1.0)
            }
            None => 0.0,
        }
    }

    pub fn with_derived_metrics(mut self, now: DateTime<Utc>) -> Self {
        self.combined_records_processed_per_second = self.records_per_second_at(now);
        self
    }

    /// Stamp status and timestamps for a transition the state machine accepted
    pub(crate) fn apply_status(&mut self, status: JobStatus, now: DateTime<Utc>) {
        if status != JobStatus::Queued && self.start_time.is_none() {
            self.start_time = Some(now);
        }
        if status.sets_end_time() {
            self.end_time = Some(now);
        }
        self.status = status;
    }
}
