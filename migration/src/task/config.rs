use std::sync::Arc;
use std::time::Duration;

use config::shared::{JobConfig, RetryConfig};

use crate::dialect::ChangeFeed;
use crate::position::IncrementalPosition;
use crate::types::{TableName, TableSchema};

/// One table copied and streamed by a job item.
#[derive(Debug, Clone, PartialEq)]
pub struct TableTaskConfig {
    pub source_table: TableName,
    pub target_table: TableName,
    /// Integer unique key used for chunking, if the table has one.
    pub unique_key: Option<String>,
    pub source_schema: TableSchema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumperConfig {
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImporterConfig {
    pub batch_size: usize,
    pub worker_threads: usize,
    pub write_concurrency: usize,
    pub records_per_second: Option<u64>,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalTaskConfig {
    pub max_batch_size: usize,
    pub max_fill: Duration,
    pub poll_interval: Duration,
}

/// Configuration of the tasks of one job item, derived once at prepare time.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub job_id: String,
    pub item: u32,
    /// Whether existing rows are copied.
    pub full: bool,
    pub tables: Vec<Arc<TableTaskConfig>>,
    pub dumper: DumperConfig,
    pub importer: ImporterConfig,
    pub incremental: IncrementalTaskConfig,
    pub feed: ChangeFeed,
    /// Where change capture starts. Recorded before any inventory read.
    pub start_position: Option<IncrementalPosition>,
}

impl TaskConfig {
    pub fn new(job_id: &str, item: u32, job: &JobConfig, tables: Vec<Arc<TableTaskConfig>>) -> Self {
        let process = &job.process;
        let feed = ChangeFeed::new(
            job_id,
            item,
            tables.iter().map(|table| table.source_table.clone()).collect(),
        );

        Self {
            job_id: job_id.to_string(),
            item,
            full: job.full,
            tables,
            dumper: DumperConfig {
                batch_size: process.batch_size,
            },
            importer: ImporterConfig {
                batch_size: process.batch_size,
                worker_threads: process.worker_threads,
                write_concurrency: process.write_concurrency,
                records_per_second: process
                    .rate_limit
                    .as_ref()
                    .map(|limit| limit.records_per_second),
                retry: process.retry.clone(),
            },
            incremental: IncrementalTaskConfig {
                max_batch_size: process.incremental.max_batch_size,
                max_fill: Duration::from_millis(process.incremental.max_fill_ms),
                poll_interval: Duration::from_millis(process.incremental.poll_interval_ms),
            },
            feed,
            start_position: None,
        }
    }
}
