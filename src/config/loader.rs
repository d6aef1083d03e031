//! Configuration Loader
//!
//! Layers defaults, an optional TOML file and `TASKER_BATCH__*` environment
//! variables into a validated [`BatchConfig`].

use super::error::{ConfigResult, ConfigurationError};
use super::BatchConfig;
use config::{Config, Environment, File};
use std::path::Path;
use tracing::debug;

/// Environment variable prefix for overrides, e.g. `TASKER_BATCH__WORKER_COUNT=16`
pub const ENV_PREFIX: &str = "TASKER_BATCH";

/// Load configuration with an optional file on top of the defaults
pub fn load(path: Option<&Path>) -> ConfigResult<BatchConfig> {
    let defaults = Config::try_from(&BatchConfig::default())
        .map_err(|e| ConfigurationError::source_error("defaults", e))?;

    let mut builder = Config::builder().add_source(defaults);

    if let Some(path) = path {
        if !path.is_file() {
            return Err(ConfigurationError::ConfigFileNotFound {
                path: path.display().to_string(),
            });
        }
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let source_name = path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "environment".to_string());

    let config: BatchConfig = builder
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| ConfigurationError::source_error(source_name.clone(), e))?;

    config.validate()?;

    debug!(
        source = %source_name,
        worker_count = config.worker_count,
        cleanup_interval_ms = config.cleanup_interval_ms,
        "Batch configuration loaded"
    );

    Ok(config)
}
