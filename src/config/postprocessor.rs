//! Postprocessor worker pool configuration.

use serde::Deserialize;

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default per-worker queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Change-stream worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostprocessorConfig {
    /// Worker count. Each partition key maps to exactly one worker.
    pub workers: usize,
    /// Bounded queue depth per worker.
    pub queue_capacity: usize,
}

impl Default for PostprocessorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}
