//! # Bulk NDJSON Import
//!
//! Runs the `bulk-import-ndjson` job over the given files and prints the
//! settled instance as JSON.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tasker_batch::jobs::bulk_import::{self, InMemoryResourceSink};
use tasker_batch::logging::init_structured_logging;
use tasker_batch::{BatchConfig, JobDefinitionRegistry, JobEngine, JobInstanceStartRequest};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bulk-import")]
#[command(about = "Import FHIR resources from NDJSON files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// TOML configuration file layered over the defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum lines per consume chunk (whole file when unset)
    #[arg(long)]
    lines_per_chunk: Option<usize>,

    /// Seconds to wait for the import to settle
    #[arg(long, default_value_t = 600)]
    timeout_seconds: u64,

    /// NDJSON files to import
    #[arg(required = true, num_args = 1..)]
    files: Vec<String>,
}

impl Cli {
    fn start_request(&self) -> Result<JobInstanceStartRequest> {
        if let Some(file) = self.files.iter().find(|f| f.contains(',')) {
            bail!("File paths must not contain commas: {file}");
        }
        let mut request = JobInstanceStartRequest::new(bulk_import::JOB_DEFINITION_ID)
            .with_parameter(bulk_import::NDJSON_PATHS_PARAMETER, self.files.join(","));
        if let Some(lines) = self.lines_per_chunk {
            request = request.with_parameter(bulk_import::LINES_PER_CHUNK_PARAMETER, lines.to_string());
        }
        Ok(request)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_structured_logging();

    let request = cli.start_request()?;
    let config = BatchConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let sink = Arc::new(InMemoryResourceSink::new());
    let registry = JobDefinitionRegistry::builder()
        .register(bulk_import::job_definition_with_sink(sink.clone()))
        .build()?;

    let engine = JobEngine::new(config, registry)?;
    engine.start()?;

    let instance_id = engine.coordinator().start_instance(request).await?;
    info!(instance_id = %instance_id, files = cli.files.len(), "Bulk import started");

    let settled = engine
        .await_settled(instance_id, Duration::from_secs(cli.timeout_seconds))
        .await;
    engine.shutdown().await;
    let instance = settled?;

    info!(
        instance_id = %instance_id,
        status = %instance.status,
        stored = sink.len(),
        "Bulk import settled"
    );
    println!("{}", serde_json::to_string_pretty(&instance)?);
    Ok(())
}
