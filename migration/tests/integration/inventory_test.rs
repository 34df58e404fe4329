use std::collections::BTreeMap;

use migration::coordination::{JobRepository, MemoryLockService, MemoryRegistry};
use migration::error::ErrorKind;
use migration::position::{IncrementalPosition, InventoryPosition};
use migration::progress::{JobItemProgress, JobItemStatus};
use migration::test_utils::job::{create_job, job_config, memory_dialect};
use migration::test_utils::table::{
    seed_t_order, t_order, t_order_row, t_order_schema, t_order_statuses,
};
use telemetry::init_test_tracing;

const JOB_ID: &str = "j01inventory";

/// Progress of an item stopped while copying the first chunk of `t_order` 1..=10.
fn interrupted_progress() -> JobItemProgress {
    let mut progress = JobItemProgress::with_status(JobItemStatus::ExecuteInventoryTask);
    progress.inventory = BTreeMap::from([
        (
            "t_order#0".to_string(),
            InventoryPosition::Range {
                lower: 1,
                upper: Some(4),
                last: Some(2),
            },
        ),
        ("t_order#1".to_string(), InventoryPosition::range(4, Some(7))),
        ("t_order#2".to_string(), InventoryPosition::range(7, Some(10))),
        ("t_order#3".to_string(), InventoryPosition::range(10, Some(11))),
    ]);
    progress.inventory_records_count = 10;
    progress
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupted_inventory_resumes_after_the_last_copied_key() {
    init_test_tracing();
    let (dialect, source, target) = memory_dialect();
    seed_t_order(&source, 1..=10).await;
    source.set_supports_change_capture(false);

    // Rows copied before the interruption are marked so a second copy would be visible.
    target.create_table(t_order_schema()).await;
    target
        .insert_rows(&t_order(), vec![t_order_row(1, "stale"), t_order_row(2, "stale")])
        .await
        .unwrap();

    let registry = MemoryRegistry::new();
    let repository = JobRepository::new(registry.clone());
    repository
        .persist_progress(JOB_ID, 0, &interrupted_progress())
        .await
        .unwrap();

    let mut job = create_job(
        JOB_ID,
        job_config(1),
        dialect,
        registry,
        MemoryLockService::new(),
    );
    job.start(&[]).await.unwrap();
    job.wait().await.unwrap();

    let mut expected = vec![(1, "stale".to_string()), (2, "stale".to_string())];
    expected.extend((3..=10).map(|order_id| (order_id, "new".to_string())));
    assert_eq!(t_order_statuses(&target).await, expected);
    assert_eq!(target.ddl_statements().await, 0);

    let progress = repository.load_progress(JOB_ID, 0).await.unwrap().unwrap();
    assert_eq!(progress.status, JobItemStatus::Finished);
    assert_eq!(progress.inventory.len(), 4);
    assert!(progress.inventory_finished());
    assert_eq!(progress.inventory_records_count, 10);
    assert_eq!(progress.processed_records_count, 8);
}

#[tokio::test(flavor = "multi_thread")]
async fn inventory_resumed_from_a_partial_chunk_map_copies_every_remaining_key() {
    init_test_tracing();
    let (dialect, source, target) = memory_dialect();
    seed_t_order(&source, 1..=10).await;
    source.set_supports_change_capture(false);
    target.create_table(t_order_schema()).await;

    // Only the first chunk was saved before the item stopped.
    let mut progress = JobItemProgress::with_status(JobItemStatus::ExecuteInventoryTask);
    progress.inventory = BTreeMap::from([(
        "t_order#0".to_string(),
        InventoryPosition::Range {
            lower: 1,
            upper: Some(4),
            last: Some(3),
        },
    )]);
    let registry = MemoryRegistry::new();
    let repository = JobRepository::new(registry.clone());
    repository.persist_progress(JOB_ID, 0, &progress).await.unwrap();

    let mut job = create_job(JOB_ID, job_config(1), dialect, registry, MemoryLockService::new());
    job.start(&[]).await.unwrap();
    job.wait().await.unwrap();

    let copied: Vec<i64> = t_order_statuses(&target)
        .await
        .into_iter()
        .map(|(order_id, _)| order_id)
        .collect();
    assert_eq!(copied, (4..=10).collect::<Vec<_>>());

    let progress = repository.load_progress(JOB_ID, 0).await.unwrap().unwrap();
    assert_eq!(progress.status, JobItemStatus::Finished);
    assert_eq!(progress.inventory.len(), 4);
    assert!(progress.inventory_finished());
}

#[tokio::test(flavor = "multi_thread")]
async fn chunks_are_saved_before_any_of_them_is_copied() {
    init_test_tracing();
    let (dialect, source, target) = memory_dialect();
    seed_t_order(&source, 1..=10).await;
    source.set_supports_change_capture(false);
    // Every write fails without retry, so no chunk records a position of its own.
    let mut config = job_config(1);
    config.process.retry.max_attempts = 1;
    target.fail_next_writes(100).await;

    let registry = MemoryRegistry::new();
    let repository = JobRepository::new(registry.clone());
    let mut job = create_job(JOB_ID, config, dialect, registry, MemoryLockService::new());
    job.start(&[]).await.unwrap();
    job.wait().await.unwrap_err();

    let progress = repository.load_progress(JOB_ID, 0).await.unwrap().unwrap();
    assert_eq!(progress.status, JobItemStatus::ExecuteInventoryTaskFailure);
    assert_eq!(
        progress.inventory,
        BTreeMap::from([
            ("t_order#0".to_string(), InventoryPosition::range(1, Some(4))),
            ("t_order#1".to_string(), InventoryPosition::range(4, Some(7))),
            ("t_order#2".to_string(), InventoryPosition::range(7, Some(10))),
            ("t_order#3".to_string(), InventoryPosition::range(10, Some(11))),
        ])
    );
}

/// Progress of an item that finished with a change stream checkpoint.
fn finished_progress() -> JobItemProgress {
    let mut progress = JobItemProgress::with_status(JobItemStatus::Finished);
    progress.incremental.position = Some(IncrementalPosition::Sequence(42));
    progress.processed_records_count = 7;
    progress.inventory_records_count = 7;
    progress
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_items_are_not_run_again() {
    init_test_tracing();
    let (dialect, source, target) = memory_dialect();
    seed_t_order(&source, 1..=3).await;

    let registry = MemoryRegistry::new();
    let repository = JobRepository::new(registry.clone());
    repository
        .persist_progress(JOB_ID, 0, &finished_progress())
        .await
        .unwrap();

    let mut job = create_job(JOB_ID, job_config(1), dialect, registry, MemoryLockService::new());
    job.start(&[]).await.unwrap();
    job.wait().await.unwrap();

    assert!(!target.has_table(&t_order()).await);
    let persisted = repository.load_progress(JOB_ID, 0).await.unwrap().unwrap();
    assert_eq!(persisted, finished_progress());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_items_must_be_reset_before_running_again() {
    init_test_tracing();
    let (dialect, source, _target) = memory_dialect();
    seed_t_order(&source, 1..=3).await;

    let mut failed = JobItemProgress::with_status(JobItemStatus::ExecuteInventoryTaskFailure);
    failed.error_message = Some("target rejected the batch".to_string());
    failed.processed_records_count = 3;
    let registry = MemoryRegistry::new();
    let repository = JobRepository::new(registry.clone());
    repository.persist_progress(JOB_ID, 0, &failed).await.unwrap();

    let mut job = create_job(JOB_ID, job_config(1), dialect, registry, MemoryLockService::new());
    job.start(&[]).await.unwrap();
    let err = job.wait().await.unwrap_err();

    assert_eq!(err.kinds(), vec![ErrorKind::InvalidJobState]);
    let persisted = repository.load_progress(JOB_ID, 0).await.unwrap().unwrap();
    assert_eq!(persisted, failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_write_failures_are_retried() {
    init_test_tracing();
    let (dialect, source, target) = memory_dialect();
    seed_t_order(&source, 1..=10).await;
    source.set_supports_change_capture(false);
    target.fail_next_writes(2).await;

    let registry = MemoryRegistry::new();
    let repository = JobRepository::new(registry.clone());
    let mut job = create_job(JOB_ID, job_config(1), dialect, registry, MemoryLockService::new());
    job.start(&[]).await.unwrap();
    job.wait().await.unwrap();

    assert_eq!(t_order_statuses(&target).await, t_order_statuses(&source).await);
    let progress = repository.load_progress(JOB_ID, 0).await.unwrap().unwrap();
    assert_eq!(progress.status, JobItemStatus::Finished);
    assert_eq!(progress.processed_records_count, 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_items_are_rejected() {
    init_test_tracing();
    let (dialect, _source, _target) = memory_dialect();

    let mut job = create_job(
        JOB_ID,
        job_config(1),
        dialect,
        MemoryRegistry::new(),
        MemoryLockService::new(),
    );
    let err = job.start(&[1]).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfigError);
}
