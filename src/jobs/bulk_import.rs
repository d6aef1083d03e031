//! # Bulk NDJSON Import
//!
//! Reference two-step job:
//!
//! 1. `fetch-files`: one chunk per path in the comma separated `ndjson_paths`
//!    parameter. Reads the file and emits its non-blank lines, in batches of
//!    `lines_per_chunk` (whole file when unset).
//! 2. `consume-resources`: one chunk per emitted batch. Every line must be a
//!    JSON object whose `resourceType` is in the allowed set; accepted
//!    resources are handed to a [`ResourceSink`].
//!
//! Failure semantics:
//!
//! - unreadable file, unparseable line or sink failure: recoverable, only the
//!   chunk fails
//! - unknown `resourceType`: unrecoverable, the instance fails
//!
//! A batch is validated in full before anything is stored, but storage itself
//! is not transactional: when the sink fails partway through a batch, the
//! resources stored before the failure stay stored and the chunk fails with a
//! message saying how many made it.

use crate::error::StepError;
use crate::execution::step_handler::{
    ChunkContext, ParameterListProducer, StepHandler, StepOutcome,
};
use crate::models::{ChunkSource, JobDefinition, ParameterDefinition, StepDefinition};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub const JOB_DEFINITION_ID: &str = "bulk-import-ndjson";
pub const FETCH_STEP_ID: &str = "fetch-files";
pub const CONSUME_STEP_ID: &str = "consume-resources";
pub const NDJSON_PATHS_PARAMETER: &str = "ndjson_paths";
pub const LINES_PER_CHUNK_PARAMETER: &str = "lines_per_chunk";

pub const DEFAULT_RESOURCE_TYPES: &[&str] = &[
    "AllergyIntolerance",
    "Condition",
    "Encounter",
    "Immunization",
    "MedicationRequest",
    "Observation",
    "Organization",
    "Patient",
    "Practitioner",
    "Procedure",
];

/// Destination for accepted resources
#[async_trait]
pub trait ResourceSink: Send + Sync {
    async fn store(&self, resource_type: &str, resource: Value) -> Result<(), StepError>;
}

/// Keeps every stored resource in memory
#[derive(Debug, Default)]
pub struct InMemoryResourceSink {
    resources: Mutex<Vec<Value>>,
}

impl InMemoryResourceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.resources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.lock().is_empty()
    }

    pub fn resources(&self) -> Vec<Value> {
        self.resources.lock().clone()
    }
}

#[async_trait]
impl ResourceSink for InMemoryResourceSink {
    async fn store(&self, _resource_type: &str, resource: Value) -> Result<(), StepError> {
        self.resources.lock().push(resource);
        Ok(())
    }
}

/// Reads one NDJSON file and emits its lines in batches
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchFilesHandler;

#[async_trait]
impl StepHandler for FetchFilesHandler {
    async fn process(&self, context: &ChunkContext) -> Result<StepOutcome, StepError> {
        let path = context.payload_str()?;
        let lines_per_chunk = match context.parameter(LINES_PER_CHUNK_PARAMETER) {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => Some(n),
                _ => {
                    return Err(StepError::unrecoverable(format!(
                        "Invalid {LINES_PER_CHUNK_PARAMETER} value: {raw}"
                    )))
                }
            },
            None => None,
        };

        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StepError::recoverable(format!("Unable to read {path}: {e}")))?;
        let lines: Vec<&str> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        debug!(path = %path, lines = lines.len(), "Fetched NDJSON file");

        let batch_size = lines_per_chunk.unwrap_or(lines.len()).max(1);
        let emitted = lines
            .chunks(batch_size)
            .map(|batch| json!({ "source": path, "lines": batch }))
            .collect();

        Ok(StepOutcome::processed(0).with_emitted(emitted))
    }

    fn handler_name(&self) -> &'static str {
        "fetch_files_handler"
    }
}

/// Parses a batch of NDJSON lines and stores the resources
pub struct ConsumeResourcesHandler {
    allowed_resource_types: HashSet<String>,
    sink: Arc<dyn ResourceSink>,
}

impl std::fmt::Debug for ConsumeResourcesHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumeResourcesHandler")
            .field("allowed_resource_types", &self.allowed_resource_types)
            .finish_non_exhaustive()
    }
}

impl ConsumeResourcesHandler {
    pub fn new(
        allowed_resource_types: impl IntoIterator<Item = impl Into<String>>,
        sink: Arc<dyn ResourceSink>,
    ) -> Self {
        Self {
            allowed_resource_types: allowed_resource_types.into_iter().map(Into::into).collect(),
            sink,
        }
    }

    fn parse_line(&self, source: &str, index: usize, line: &str) -> Result<(String, Value), StepError> {
        let resource: Value = serde_json::from_str(line).map_err(|e| {
            StepError::recoverable(format!("Invalid NDJSON at {source} line {}: {e}", index + 1))
        })?;

        let resource_type = resource
            .get("resourceType")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StepError::recoverable(format!(
                    "Missing resourceType at {source} line {}",
                    index + 1
                ))
            })?
            .to_string();

        if !self.allowed_resource_types.contains(&resource_type) {
            return Err(StepError::unrecoverable(format!(
                "Unknown resource name \"{resource_type}\""
            )));
        }
        Ok((resource_type, resource))
    }
}

#[async_trait]
impl StepHandler for ConsumeResourcesHandler {
    async fn process(&self, context: &ChunkContext) -> Result<StepOutcome, StepError> {
        let source = context
            .payload
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("<unknown>");
        let lines = context
            .payload
            .get("lines")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                StepError::unrecoverable(format!(
                    "Step '{}' expected a line batch payload",
                    context.step_id
                ))
            })?;

        // Validate the whole batch before storing anything
        let mut resources = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            let line = line.as_str().ok_or_else(|| {
                StepError::recoverable(format!("Non-string line {} in {source}", index + 1))
            })?;
            resources.push(self.parse_line(source, index, line)?);
        }

        let count = resources.len();
        for (stored, (resource_type, resource)) in resources.into_iter().enumerate() {
            if let Err(e) = self.sink.store(&resource_type, resource).await {
                let message =
                    format!("Stored {stored} of {count} resources from {source} before failure: {e}");
                return Err(match e {
                    StepError::Recoverable(_) => StepError::recoverable(message),
                    StepError::Unrecoverable(_) => StepError::unrecoverable(message),
                });
            }
        }
        Ok(StepOutcome::processed(count as u64))
    }

    fn handler_name(&self) -> &'static str {
        "consume_resources_handler"
    }
}

/// The job with the default resource types, storing into `sink`
pub fn job_definition_with_sink(sink: Arc<dyn ResourceSink>) -> JobDefinition {
    job_definition_with(DEFAULT_RESOURCE_TYPES.iter().copied(), sink)
}

pub fn job_definition_with(
    allowed_resource_types: impl IntoIterator<Item = impl Into<String>>,
    sink: Arc<dyn ResourceSink>,
) -> JobDefinition {
    JobDefinition::new(JOB_DEFINITION_ID)
        .with_description("Import FHIR resources from NDJSON files")
        .with_step(
            StepDefinition::chunked(
                FETCH_STEP_ID,
                ChunkSource::Parameters(Arc::new(ParameterListProducer::new(
                    NDJSON_PATHS_PARAMETER,
                ))),
                Arc::new(FetchFilesHandler),
            )
            .with_parameter(
                ParameterDefinition::required(NDJSON_PATHS_PARAMETER)
                    .with_description("Comma separated NDJSON file paths"),
            )
            .with_parameter(
                ParameterDefinition::optional(LINES_PER_CHUNK_PARAMETER)
                    .with_description("Maximum lines per consume chunk"),
            ),
        )
        .with_step(StepDefinition::chunked(
            CONSUME_STEP_ID,
            ChunkSource::PreviousStep,
            Arc::new(ConsumeResourcesHandler::new(allowed_resource_types, sink)),
        ))
}

/// The job with the default resource types, keeping resources in memory
pub fn job_definition() -> JobDefinition {
    job_definition_with_sink(Arc::new(InMemoryResourceSink::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use uuid::Uuid;

    fn context(step_id: &str, payload: Value, parameters: HashMap<String, String>) -> ChunkContext {
        ChunkContext {
            instance_id: Uuid::new_v4(),
            chunk_id: Uuid::new_v4(),
            job_definition_id: JOB_DEFINITION_ID.to_string(),
            step_id: step_id.to_string(),
            step_index: 0,
            payload,
            parameters: Arc::new(parameters),
        }
    }

    #[tokio::test]
    async fn test_fetch_emits_non_blank_lines_in_batches() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"resourceType\":\"Patient\"}}").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{{\"resourceType\":\"Observation\"}}").unwrap();
        writeln!(file, "{{\"resourceType\":\"Observation\"}}").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let whole = FetchFilesHandler
            .process(&context(FETCH_STEP_ID, json!(path), HashMap::new()))
            .await
            .unwrap();
        assert_eq!(whole.emitted.len(), 1);
        assert_eq!(whole.emitted[0]["lines"].as_array().unwrap().len(), 3);
        assert_eq!(whole.records_processed, 0);

        let batched = FetchFilesHandler
            .process(&context(
                FETCH_STEP_ID,
                json!(path),
                HashMap::from([(LINES_PER_CHUNK_PARAMETER.to_string(), "2".to_string())]),
            ))
            .await
            .unwrap();
        assert_eq!(batched.emitted.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_missing_file_is_recoverable() {
        let err = FetchFilesHandler
            .process(&context(FETCH_STEP_ID, json!("/nonexistent/file.ndjson"), HashMap::new()))
            .await
            .unwrap_err();
        assert!(!err.is_unrecoverable());
    }

    #[tokio::test]
    async fn test_consume_stores_allowed_resources() {
        let sink = Arc::new(InMemoryResourceSink::new());
        let handler = ConsumeResourcesHandler::new(DEFAULT_RESOURCE_TYPES.iter().copied(), sink.clone());
        let payload = json!({
            "source": "a.ndjson",
            "lines": ["{\"resourceType\":\"Patient\",\"id\":\"P1\"}", "{\"resourceType\":\"Observation\"}"]
        });

        let outcome = handler
            .process(&context(CONSUME_STEP_ID, payload, HashMap::new()))
            .await
            .unwrap();
        assert_eq!(outcome.records_processed, 2);
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn test_consume_failure_classes() {
        let sink = Arc::new(InMemoryResourceSink::new());
        let handler = ConsumeResourcesHandler::new(["Patient"], sink.clone());

        let unknown = handler
            .process(&context(
                CONSUME_STEP_ID,
                json!({ "source": "b.ndjson", "lines": ["{\"resourceType\":\"Foo\"}"] }),
                HashMap::new(),
            ))
            .await
            .unwrap_err();
        assert!(unknown.is_unrecoverable());
        assert!(unknown.message().contains("Unknown resource name \"Foo\""));

        let garbled = handler
            .process(&context(
                CONSUME_STEP_ID,
                json!({ "source": "c.ndjson", "lines": ["{\"resourceType\":\"Patient\"}", "{not json"] }),
                HashMap::new(),
            ))
            .await
            .unwrap_err();
        assert!(!garbled.is_unrecoverable());
        assert!(sink.is_empty());
    }

    /// Rejects the resource whose id is `bad`, stores the rest
    #[derive(Debug, Default)]
    struct RejectingSink {
        inner: InMemoryResourceSink,
    }

    #[async_trait]
    impl ResourceSink for RejectingSink {
        async fn store(&self, resource_type: &str, resource: Value) -> Result<(), StepError> {
            if resource.get("id") == Some(&json!("bad")) {
                return Err(StepError::recoverable("write rejected"));
            }
            self.inner.store(resource_type, resource).await
        }
    }

    #[tokio::test]
    async fn test_consume_sink_failure_keeps_earlier_resources() {
        let sink = Arc::new(RejectingSink::default());
        let handler = ConsumeResourcesHandler::new(["Patient"], sink.clone());
        let payload = json!({
            "source": "d.ndjson",
            "lines": [
                "{\"resourceType\":\"Patient\",\"id\":\"P1\"}",
                "{\"resourceType\":\"Patient\",\"id\":\"bad\"}",
                "{\"resourceType\":\"Patient\",\"id\":\"P3\"}"
            ]
        });

        let err = handler
            .process(&context(CONSUME_STEP_ID, payload, HashMap::new()))
            .await
            .unwrap_err();
        assert!(!err.is_unrecoverable());
        assert!(err.message().contains("Stored 1 of 3 resources from d.ndjson"));
        assert!(err.message().contains("write rejected"));
        assert_eq!(sink.inner.len(), 1);
    }
}
