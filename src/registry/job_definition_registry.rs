//! # Job Definition Registry
//!
//! Read-only catalog of job definitions keyed by job-type id. Built once at
//! startup through [`JobDefinitionRegistryBuilder`]; every definition is
//! validated at build time so a bad catalog fails before any job starts.

use crate::error::{BatchError, BatchResult};
use crate::models::{ChunkSource, JobDefinition};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Registry statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_definitions: usize,
    pub total_steps: usize,
    pub definition_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct JobDefinitionRegistry {
    definitions: HashMap<String, Arc<JobDefinition>>,
}

impl JobDefinitionRegistry {
    pub fn builder() -> JobDefinitionRegistryBuilder {
        JobDefinitionRegistryBuilder::default()
    }

    /// Look up a definition by job-type id
    pub fn get(&self, job_definition_id: &str) -> BatchResult<Arc<JobDefinition>> {
        self.definitions
            .get(job_definition_id)
            .cloned()
            .ok_or_else(|| BatchError::JobDefinitionNotFound(job_definition_id.to_string()))
    }

    pub fn contains(&self, job_definition_id: &str) -> bool {
        self.definitions.contains_key(job_definition_id)
    }

    pub fn stats(&self) -> RegistryStats {
        let mut definition_ids: Vec<String> = self.definitions.keys().cloned().collect();
        definition_ids.sort();
        RegistryStats {
            total_definitions: self.definitions.len(),
            total_steps: self.definitions.values().map(|d| d.steps.len()).sum(),
            definition_ids,
        }
    }
}

#[derive(Debug, Default)]
pub struct JobDefinitionRegistryBuilder {
    definitions: Vec<JobDefinition>,
}

impl JobDefinitionRegistryBuilder {
    pub fn register(mut self, definition: JobDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn build(self) -> BatchResult<JobDefinitionRegistry> {
        let mut definitions = HashMap::with_capacity(self.definitions.len());

        for definition in self.definitions {
            validate_definition(&definition)?;

            let id = definition.job_definition_id.clone();
            if definitions.contains_key(&id) {
                return Err(BatchError::ConfigurationError(format!(
                    "Duplicate job definition id: {id}"
                )));
            }

            debug!(
                job_definition_id = %id,
                steps = definition.steps.len(),
                "Registered job definition"
            );
            definitions.insert(id, Arc::new(definition));
        }

        info!(
            total_definitions = definitions.len(),
            "Job definition registry built"
        );

        Ok(JobDefinitionRegistry { definitions })
    }
}

fn validate_definition(definition: &JobDefinition) -> BatchResult<()> {
    let id = &definition.job_definition_id;

    if id.trim().is_empty() {
        return Err(BatchError::ConfigurationError(
            "Job definition id must not be blank".to_string(),
        ));
    }

    let first = definition.first_step().ok_or_else(|| {
        BatchError::ConfigurationError(format!("Job definition {id} has no steps"))
    })?;

    if matches!(first.source, ChunkSource::PreviousStep) {
        return Err(BatchError::ConfigurationError(format!(
            "First step '{}' of job definition {id} cannot consume a previous step",
            first.step_id
        )));
    }

    let mut seen = HashSet::new();
    for step in &definition.steps {
        if !seen.insert(step.step_id.as_str()) {
            return Err(BatchError::ConfigurationError(format!(
                "Duplicate step id '{}' in job definition {id}",
                step.step_id
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::step_handler::{
        ChunkContext, FnStepHandler, StaticChunkProducer, StepHandler, StepOutcome,
    };
    use crate::models::StepDefinition;

    fn handler() -> Arc<dyn StepHandler> {
        Arc::new(FnStepHandler::new(|_: &ChunkContext| Ok(StepOutcome::processed(1))))
    }

    fn producer_source() -> ChunkSource {
        ChunkSource::Parameters(Arc::new(StaticChunkProducer::new(vec![])))
    }

    fn definition(id: &str) -> JobDefinition {
        JobDefinition::new(id).with_step(StepDefinition::chunked("s1", producer_source(), handler()))
    }

    #[test]
    fn test_lookup_and_not_found() {
        let registry = JobDefinitionRegistry::builder()
            .register(definition("import"))
            .build()
            .unwrap();

        assert!(registry.get("import").is_ok());
        assert!(registry.contains("import"));
        assert_eq!(
            registry.get("missing").unwrap_err(),
            BatchError::JobDefinitionNotFound("missing".to_string())
        );
    }

    #[test]
    fn test_duplicate_definition_ids_fail_fast() {
        let err = JobDefinitionRegistry::builder()
            .register(definition("import"))
            .register(definition("import"))
            .build()
            .unwrap_err();
        assert!(matches!(err, BatchError::ConfigurationError(msg) if msg.contains("Duplicate")));
    }

    #[test]
    fn test_empty_definition_rejected() {
        let err = JobDefinitionRegistry::builder()
            .register(JobDefinition::new("empty"))
            .build()
            .unwrap_err();
        assert!(matches!(err, BatchError::ConfigurationError(_)));
    }

    #[test]
    fn test_first_step_must_have_producer() {
        let bad = JobDefinition::new("bad")
            .with_step(StepDefinition::chunked("s1", ChunkSource::PreviousStep, handler()));
        assert!(JobDefinitionRegistry::builder().register(bad).build().is_err());
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let bad = definition("bad").with_step(StepDefinition::chunked(
            "s1",
            ChunkSource::PreviousStep,
            handler(),
        ));
        assert!(JobDefinitionRegistry::builder().register(bad).build().is_err());
    }

    #[test]
    fn test_stats() {
        let registry = JobDefinitionRegistry::builder()
            .register(definition("b"))
            .register(definition("a"))
            .build()
            .unwrap();
        let stats = registry.stats();
        assert_eq!(stats.total_definitions, 2);
        assert_eq!(stats.total_steps, 2);
        assert_eq!(stats.definition_ids, vec!["a".to_string(), "b".to_string()]);
    }
}
