//! # Batch Engine Configuration
//!
//! Runtime knobs for the worker pool, the cleanup loop and the event channel.
//!
//! Values are layered by [`loader::load`]: built-in defaults, then an optional
//! TOML file, then `TASKER_BATCH__*` environment variables.
//!
//! ```toml
//! worker_count = 8
//! cleanup_interval_ms = 1000
//! orphaned_chunk_requeue_seconds = 300
//! stalled_chunk_seconds = 3600
//! chunk_retention_seconds = 3600
//! event_channel_capacity = 1000
//! worker_idle_poll_ms = 250
//! ```

pub mod error;
pub mod loader;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::load;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Number of concurrent chunk workers
    pub worker_count: usize,
    /// Interval between background cleanup passes
    pub cleanup_interval_ms: u64,
    /// PENDING chunks of an active step that sat this long since enqueue are re-enqueued
    pub orphaned_chunk_requeue_seconds: u64,
    /// IN_PROGRESS chunks claimed this long ago are released back to PENDING
    pub stalled_chunk_seconds: u64,
    /// How long chunks of a terminal instance are kept for error attribution
    pub chunk_retention_seconds: u64,
    /// Capacity of the lifecycle event broadcast channel
    pub event_channel_capacity: usize,
    /// Upper bound a worker waits on an empty queue before re-checking shutdown
    pub worker_idle_poll_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            cleanup_interval_ms: 1000,
            orphaned_chunk_requeue_seconds: 300,
            stalled_chunk_seconds: 3600,
            chunk_retention_seconds: 3600,
            event_channel_capacity: 1000,
            worker_idle_poll_ms: 250,
        }
    }
}

impl BatchConfig {
    /// Layered load, see [`loader::load`]
    pub fn load(path: Option<&std::path::Path>) -> ConfigResult<Self> {
        loader::load(path)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.worker_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker_count",
                self.worker_count,
                "at least one worker is required",
            ));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "cleanup_interval_ms",
                self.cleanup_interval_ms,
                "interval must be greater than zero",
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "event_channel_capacity",
                self.event_channel_capacity,
                "broadcast channel capacity must be greater than zero",
            ));
        }
        for (field, seconds) in [
            ("orphaned_chunk_requeue_seconds", self.orphaned_chunk_requeue_seconds),
            ("stalled_chunk_seconds", self.stalled_chunk_seconds),
            ("chunk_retention_seconds", self.chunk_retention_seconds),
        ] {
            if seconds_delta(seconds).is_none() {
                return Err(ConfigurationError::invalid_value(
                    field,
                    seconds,
                    "duration is out of range",
                ));
            }
        }
        if self.worker_idle_poll_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker_idle_poll_ms",
                self.worker_idle_poll_ms,
                "poll interval must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn worker_idle_poll(&self) -> Duration {
        Duration::from_millis(self.worker_idle_poll_ms)
    }

    // Out-of-range values saturate; validate() rejects them before an engine is built
    pub fn orphaned_chunk_requeue_after(&self) -> TimeDelta {
        seconds_delta(self.orphaned_chunk_requeue_seconds).unwrap_or(TimeDelta::MAX)
    }

    pub fn stalled_chunk_after(&self) -> TimeDelta {
        seconds_delta(self.stalled_chunk_seconds).unwrap_or(TimeDelta::MAX)
    }

    pub fn chunk_retention(&self) -> TimeDelta {
        seconds_delta(self.chunk_retention_seconds).unwrap_or(TimeDelta::MAX)
    }
}

fn seconds_delta(seconds: u64) -> Option<TimeDelta> {
    i64::try_from(seconds).ok().and_then(TimeDelta::try_seconds)
}
