use fail::FailScenario;
use migration::coordination::{JobRepository, MemoryLockService};
use migration::error::ErrorKind;
use migration::failpoints::{
    INVENTORY__BEFORE_WRITE_BATCH, PREPARE__BEFORE_CREATE_TABLES, PREPARE__BEFORE_INIT_POSITION,
};
use migration::progress::JobItemStatus;
use migration::test_utils::job::{create_job, job_config, memory_dialect};
use migration::test_utils::notifying_registry::NotifyingRegistry;
use migration::test_utils::table::{seed_t_order, t_order, t_order_statuses};
use telemetry::init_test_tracing;

const JOB_ID: &str = "j01failpoints";

#[tokio::test(flavor = "multi_thread")]
async fn table_creation_error_marks_the_item_failed() {
    let _scenario = FailScenario::setup();
    fail::cfg(PREPARE__BEFORE_CREATE_TABLES, "return").unwrap();

    init_test_tracing();
    let (dialect, source, target) = memory_dialect();
    seed_t_order(&source, 1..=5).await;

    let registry = NotifyingRegistry::new();
    let mut job = create_job(
        JOB_ID,
        job_config(1),
        dialect,
        registry.clone(),
        MemoryLockService::new(),
    );
    job.start(&[]).await.unwrap();

    let err = job.wait().await.unwrap_err();
    assert_eq!(err.kinds(), vec![ErrorKind::WithNoRetry]);

    let progress = JobRepository::new(registry)
        .load_progress(JOB_ID, 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(progress.status, JobItemStatus::PreparingFailure);
    assert!(progress.error_message.is_some());
    assert!(!target.has_table(&t_order()).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn retryable_table_creation_error_recovers() {
    let _scenario = FailScenario::setup();
    fail::cfg(PREPARE__BEFORE_CREATE_TABLES, "1*return(retry)").unwrap();

    init_test_tracing();
    let (dialect, source, target) = memory_dialect();
    seed_t_order(&source, 1..=5).await;

    let registry = NotifyingRegistry::new();
    let streaming = registry
        .notify_on_item_status(JOB_ID, 0, JobItemStatus::ExecuteIncrementalTask)
        .await;
    let mut job = create_job(
        JOB_ID,
        job_config(1),
        dialect,
        registry.clone(),
        MemoryLockService::new(),
    );
    job.start(&[]).await.unwrap();
    streaming.notified().await;

    job.shutdown_and_wait().await.unwrap();

    assert_eq!(t_order_statuses(&target).await, t_order_statuses(&source).await);
    let progress = JobRepository::new(registry)
        .load_progress(JOB_ID, 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(progress.status, JobItemStatus::ExecuteIncrementalTask);
}

#[tokio::test(flavor = "multi_thread")]
async fn start_position_error_keeps_prepared_tables() {
    let _scenario = FailScenario::setup();
    fail::cfg(PREPARE__BEFORE_INIT_POSITION, "return").unwrap();

    init_test_tracing();
    let (dialect, source, target) = memory_dialect();
    seed_t_order(&source, 1..=5).await;

    let registry = NotifyingRegistry::new();
    let mut job = create_job(
        JOB_ID,
        job_config(1),
        dialect,
        registry.clone(),
        MemoryLockService::new(),
    );
    job.start(&[]).await.unwrap();

    let err = job.wait().await.unwrap_err();
    assert_eq!(err.kinds(), vec![ErrorKind::PositionAcquisitionFailed]);

    let progress = JobRepository::new(registry)
        .load_progress(JOB_ID, 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(progress.status, JobItemStatus::PrepareSuccess);
    assert_eq!(progress.incremental.position, None);
    assert!(target.has_table(&t_order()).await);
    assert!(t_order_statuses(&target).await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn inventory_write_error_marks_the_item_failed() {
    let _scenario = FailScenario::setup();
    fail::cfg(INVENTORY__BEFORE_WRITE_BATCH, "return").unwrap();

    init_test_tracing();
    let (dialect, source, _target) = memory_dialect();
    seed_t_order(&source, 1..=10).await;

    let registry = NotifyingRegistry::new();
    let mut job = create_job(
        JOB_ID,
        job_config(1),
        dialect,
        registry.clone(),
        MemoryLockService::new(),
    );
    job.start(&[]).await.unwrap();

    let err = job.wait().await.unwrap_err();
    assert!(err.kinds().iter().all(|kind| *kind == ErrorKind::WithNoRetry));

    let progress = JobRepository::new(registry)
        .load_progress(JOB_ID, 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(progress.status, JobItemStatus::ExecuteInventoryTaskFailure);
    assert_eq!(progress.processed_records_count, 0);
    assert!(progress.incremental.position.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn inventory_write_errors_are_retried_until_attempts_run_out() {
    let _scenario = FailScenario::setup();
    fail::cfg(INVENTORY__BEFORE_WRITE_BATCH, "return(retry)").unwrap();

    init_test_tracing();
    let (dialect, source, target) = memory_dialect();
    seed_t_order(&source, 1..=3).await;

    let registry = NotifyingRegistry::new();
    let mut job = create_job(
        JOB_ID,
        job_config(1),
        dialect,
        registry.clone(),
        MemoryLockService::new(),
    );
    job.start(&[]).await.unwrap();

    let err = job.wait().await.unwrap_err();
    assert_eq!(err.kinds(), vec![ErrorKind::WithRetry]);

    let progress = JobRepository::new(registry)
        .load_progress(JOB_ID, 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(progress.status, JobItemStatus::ExecuteInventoryTaskFailure);
    assert!(t_order_statuses(&target).await.is_empty());
}
