use std::collections::BTreeMap;
use std::time::Duration;

use migration::coordination::{JobRepository, LockService, MemoryLockService, MemoryRegistry, keys};
use migration::dialect::memory::{MemoryDatabase, MemoryDialect};
use migration::error::ErrorKind;
use migration::position::{IncrementalPosition, InventoryPosition};
use migration::progress::{JobItemProgress, JobItemStatus};
use migration::test_utils::job::{SOURCE, TARGET, create_job, job_config, memory_dialect};
use migration::test_utils::table::{seed_t_order, t_order_row, t_order_schema};
use migration::types::TableName;
use telemetry::init_test_tracing;

const JOB_ID: &str = "j01resume";

/// Progress of an item that copied its inventory and was streaming changes.
fn streaming_progress() -> JobItemProgress {
    let mut progress = JobItemProgress::with_status(JobItemStatus::ExecuteIncrementalTask);
    progress.inventory = BTreeMap::from([("t_order#0".to_string(), InventoryPosition::Finished)]);
    progress.incremental.position = Some(IncrementalPosition::Sequence(42));
    progress.processed_records_count = 7;
    progress.inventory_records_count = 7;
    progress
}

#[tokio::test(flavor = "multi_thread")]
async fn items_stopped_while_waiting_for_the_lock_keep_their_progress() {
    init_test_tracing();
    let (dialect, source, _target) = memory_dialect();
    seed_t_order(&source, 1..=7).await;

    let registry = MemoryRegistry::new();
    let repository = JobRepository::new(registry.clone());
    repository
        .persist_progress(JOB_ID, 0, &streaming_progress())
        .await
        .unwrap();

    // Another process is preparing the job and keeps the lock.
    let lock_service = MemoryLockService::new();
    let guard = lock_service
        .try_lock(&keys::lock(JOB_ID), Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    let mut config = job_config(1);
    config.process.lock_timeout_ms = 600_000;
    let mut job = create_job(JOB_ID, config, dialect, registry, lock_service.clone());
    job.start(&[]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), job.shutdown_and_wait())
        .await
        .expect("stopping must not wait for the lock")
        .unwrap();

    let persisted = repository.load_progress(JOB_ID, 0).await.unwrap().unwrap();
    assert_eq!(persisted, streaming_progress());

    lock_service.unlock(guard).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn preparation_by_another_item_survives_a_failing_item() {
    init_test_tracing();
    let (dialect, source, target) = memory_dialect();
    seed_t_order(&source, 1..=6).await;
    let t_order_1 = TableName::parse("t_order_1");
    source
        .create_table(t_order_schema().renamed(t_order_1.clone()))
        .await;
    source
        .insert_rows(&t_order_1, vec![t_order_row(100, "new")])
        .await
        .unwrap();
    source.set_supports_change_capture(false);

    let registry = MemoryRegistry::new();
    let repository = JobRepository::new(registry.clone());
    let lock_service = MemoryLockService::new();

    // Item 1 runs in a process that cannot reach the source and waits long between attempts.
    let unreachable = MemoryDatabase::new();
    unreachable.set_reachable(false).await;
    let isolated = MemoryDialect::new();
    isolated.register(SOURCE, unreachable);
    isolated.register(TARGET, target.clone());
    let mut config = job_config(2);
    config.process.retry.max_attempts = 2;
    config.process.retry.initial_backoff_ms = 2_000;
    config.process.retry.max_backoff_ms = 2_000;
    let mut failing = create_job(JOB_ID, config, isolated, registry.clone(), lock_service.clone());
    failing.start(&[1]).await.unwrap();

    // Item 0 prepares the whole job meanwhile, marking item 1 prepared as well.
    let mut preparing = create_job(JOB_ID, job_config(2), dialect, registry, lock_service);
    preparing.start(&[0]).await.unwrap();
    preparing.wait().await.unwrap();
    let broadcast = repository.load_progress(JOB_ID, 1).await.unwrap().unwrap();
    assert_eq!(broadcast.status, JobItemStatus::PrepareSuccess);

    let err = failing.wait().await.unwrap_err();
    assert_eq!(err.kinds(), vec![ErrorKind::SourceConnectionFailed]);

    let persisted = repository.load_progress(JOB_ID, 1).await.unwrap().unwrap();
    assert_eq!(persisted.status, JobItemStatus::PrepareSuccess);
    assert!(persisted.error_message.is_some());
    assert_eq!(
        repository.load_progress(JOB_ID, 0).await.unwrap().unwrap().status,
        JobItemStatus::Finished
    );
}
