//! # Registry
//!
//! Catalog of job definitions consulted by the coordinator at start time.

pub mod job_definition_registry;

pub use job_definition_registry::{
    JobDefinitionRegistry, JobDefinitionRegistryBuilder, RegistryStats,
};
