use serde::{Deserialize, Serialize};

use crate::error::{CollectError, CollectResult};

/// Top-level collect-layer configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectConfig {
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub sources: SourceConfig,
}

/// Batch sizing for shard reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Rows fetched per source per refill in an ordered merge.
    /// Capped by the query limit when one is present.
    pub ordered_batch_size: usize,
    /// Rows fetched per shard per load in unordered scans.
    pub unordered_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            ordered_batch_size: 1000,
            unordered_batch_size: 1000,
        }
    }
}

/// Per-query memory accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Ceiling for the estimated bytes a single query may buffer. 0 = unlimited.
    pub query_memory_limit_bytes: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            query_memory_limit_bytes: 256 * 1024 * 1024, // 256MB
        }
    }
}

/// Shared worker pool sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker threads in the shared pool.
    pub threads: usize,
    /// Bounded queue length. A full queue rejects submissions.
    pub queue_capacity: usize,
    /// Processor-count fallback for capacity decisions. 0 = detect.
    pub processors: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: available_processors(),
            queue_capacity: 1024,
            processors: 0,
        }
    }
}

impl WorkerConfig {
    /// Effective processor count: the configured value, or the detected one.
    pub fn effective_processors(&self) -> usize {
        if self.processors > 0 {
            self.processors
        } else {
            available_processors()
        }
    }
}

/// Missing-source handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// How many times a transiently missing source is re-resolved before the
    /// droppable/required rule decides.
    pub missing_source_retries: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            missing_source_retries: 1,
        }
    }
}

impl CollectConfig {
    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(s: &str) -> CollectResult<Self> {
        let config: CollectConfig = toml::from_str(s)
            .map_err(|e| CollectError::InvalidArgument(format!("invalid collect config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CollectResult<()> {
        if self.batch.ordered_batch_size == 0 {
            return Err(CollectError::InvalidArgument(
                "batch.ordered_batch_size must be > 0".into(),
            ));
        }
        if self.batch.unordered_batch_size == 0 {
            return Err(CollectError::InvalidArgument(
                "batch.unordered_batch_size must be > 0".into(),
            ));
        }
        if self.workers.threads == 0 {
            return Err(CollectError::InvalidArgument(
                "workers.threads must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn available_processors() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
