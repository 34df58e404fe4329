use config::shared::{IncrementalConfig, JobConfig, ProcessConfig, RetryConfig, TableMapping};

use crate::coordination::{JobRepository, LockService, Registry};
use crate::dialect::memory::{MemoryDatabase, MemoryDialect};
use crate::job::Job;

pub const SOURCE: &str = "ds_0";
pub const TARGET: &str = "ds_1";

/// Process settings tuned for fast tests: small batches, short backoff and checkpoints.
pub fn test_process_config() -> ProcessConfig {
    ProcessConfig {
        batch_size: 3,
        worker_threads: 2,
        write_concurrency: 2,
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
        },
        lock_timeout_ms: 5_000,
        connect_timeout_ms: 1_000,
        checkpoint_interval_ms: 20,
        incremental: IncrementalConfig {
            max_batch_size: 100,
            max_fill_ms: 20,
            poll_interval_ms: 10,
        },
        ..ProcessConfig::default()
    }
}

/// A job migrating `t_order` from [`SOURCE`] to [`TARGET`] split into `sharding_total_count`
/// items. Extra items get `t_order_{n}` tables so the job stays valid.
pub fn job_config(sharding_total_count: u32) -> JobConfig {
    let mut tables = vec![TableMapping::new("t_order", "t_order").with_unique_key("order_id")];
    for n in 1..sharding_total_count {
        tables.push(TableMapping::new(format!("t_order_{n}"), format!("t_order_{n}")));
    }

    JobConfig {
        job_id: None,
        source: SOURCE.to_string(),
        target: TARGET.to_string(),
        tables,
        sharding_total_count,
        full: true,
        process: test_process_config(),
    }
}

/// A memory dialect with an empty source and target registered under [`SOURCE`] and
/// [`TARGET`].
pub fn memory_dialect() -> (MemoryDialect, MemoryDatabase, MemoryDatabase) {
    let dialect = MemoryDialect::new();
    let source = MemoryDatabase::new();
    let target = MemoryDatabase::new();
    dialect.register(SOURCE, source.clone());
    dialect.register(TARGET, target.clone());

    (dialect, source, target)
}

/// A job over `dialect` with `config`, not started yet.
pub fn create_job<R, L>(
    job_id: &str,
    mut config: JobConfig,
    dialect: MemoryDialect,
    registry: R,
    lock_service: L,
) -> Job<MemoryDialect, R, L>
where
    R: Registry,
    L: LockService,
{
    config.job_id = Some(job_id.to_string());

    Job::new(
        job_id.to_string(),
        config,
        dialect,
        JobRepository::new(registry),
        lock_service,
    )
}
