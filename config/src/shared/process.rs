use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Tuning knobs for the tasks of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProcessConfig {
    /// Rows read and written per inventory batch. Also the inventory chunk size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Inventory chunks copied in parallel within one sharding item.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Ordered lanes used to apply incremental changes concurrently.
    #[serde(default = "default_write_concurrency")]
    pub write_concurrency: usize,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub incremental: IncrementalConfig,
    /// Maximum wait for the job preparation lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Upper bound for connectivity checks against source and target.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Interval at which dirty progress is written to the registry.
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
}

impl ProcessConfig {
    pub const DEFAULT_BATCH_SIZE: usize = 1000;
    pub const DEFAULT_WORKER_THREADS: usize = 4;
    pub const DEFAULT_WRITE_CONCURRENCY: usize = 4;
    pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 180_000;
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
    pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 1_000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch_size == 0 {
            return Err(ValidationError::ZeroValue("batch_size"));
        }
        if self.worker_threads == 0 {
            return Err(ValidationError::ZeroValue("worker_threads"));
        }
        if self.write_concurrency == 0 {
            return Err(ValidationError::ZeroValue("write_concurrency"));
        }
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        self.retry.validate()?;
        self.incremental.validate()
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::DEFAULT_BATCH_SIZE,
            worker_threads: Self::DEFAULT_WORKER_THREADS,
            write_concurrency: Self::DEFAULT_WRITE_CONCURRENCY,
            rate_limit: None,
            retry: RetryConfig::default(),
            incremental: IncrementalConfig::default(),
            lock_timeout_ms: Self::DEFAULT_LOCK_TIMEOUT_MS,
            connect_timeout_ms: Self::DEFAULT_CONNECT_TIMEOUT_MS,
            checkpoint_interval_ms: Self::DEFAULT_CHECKPOINT_INTERVAL_MS,
        }
    }
}

fn default_batch_size() -> usize {
    ProcessConfig::DEFAULT_BATCH_SIZE
}

fn default_worker_threads() -> usize {
    ProcessConfig::DEFAULT_WORKER_THREADS
}

fn default_write_concurrency() -> usize {
    ProcessConfig::DEFAULT_WRITE_CONCURRENCY
}

fn default_lock_timeout_ms() -> u64 {
    ProcessConfig::DEFAULT_LOCK_TIMEOUT_MS
}

fn default_connect_timeout_ms() -> u64 {
    ProcessConfig::DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_checkpoint_interval_ms() -> u64 {
    ProcessConfig::DEFAULT_CHECKPOINT_INTERVAL_MS
}

/// Throughput cap applied by inventory tasks before every batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitConfig {
    pub records_per_second: u64,
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.records_per_second == 0 {
            return Err(ValidationError::ZeroValue("rate_limit.records_per_second"));
        }

        Ok(())
    }
}

/// Bounded retry applied to failed batches and re-dispatched preparation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
    pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::ZeroValue("retry.max_attempts"));
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: Self::DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: Self::DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

fn default_max_attempts() -> u32 {
    RetryConfig::DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff_ms() -> u64 {
    RetryConfig::DEFAULT_INITIAL_BACKOFF_MS
}

fn default_max_backoff_ms() -> u64 {
    RetryConfig::DEFAULT_MAX_BACKOFF_MS
}

/// Batching of the change stream consumed by incremental tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IncrementalConfig {
    /// Maximum number of changes applied as one batch.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Maximum time a partially filled batch waits before it is applied.
    #[serde(default = "default_max_fill_ms")]
    pub max_fill_ms: u64,
    /// Pause between polls of the source change log when it has nothing new.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl IncrementalConfig {
    pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;
    pub const DEFAULT_MAX_FILL_MS: u64 = 1000;
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_batch_size == 0 {
            return Err(ValidationError::ZeroValue("incremental.max_batch_size"));
        }

        Ok(())
    }
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            max_batch_size: Self::DEFAULT_MAX_BATCH_SIZE,
            max_fill_ms: Self::DEFAULT_MAX_FILL_MS,
            poll_interval_ms: Self::DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

fn default_max_batch_size() -> usize {
    IncrementalConfig::DEFAULT_MAX_BATCH_SIZE
}

fn default_max_fill_ms() -> u64 {
    IncrementalConfig::DEFAULT_MAX_FILL_MS
}

fn default_poll_interval_ms() -> u64 {
    IncrementalConfig::DEFAULT_POLL_INTERVAL_MS
}
