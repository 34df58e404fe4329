use migration::coordination::MemoryLockService;
use migration::error::ErrorKind;
use migration::job::JobApi;
use migration::progress::JobItemStatus;
use migration::test_utils::job::{job_config, memory_dialect};
use migration::test_utils::notify::wait_until;
use migration::test_utils::notifying_registry::NotifyingRegistry;
use migration::test_utils::table::{
    seed_t_order, t_order, t_order_row, t_order_schema, t_order_statuses,
};
use migration::types::{TableName, Value};
use telemetry::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn job_copies_inventory_then_streams_changes_until_committed() {
    init_test_tracing();
    let (dialect, source, target) = memory_dialect();
    seed_t_order(&source, 1..=10).await;

    let registry = NotifyingRegistry::new();
    let api = JobApi::new(dialect, registry.clone(), MemoryLockService::new());
    let job_id = api.create_job(job_config(1)).await.unwrap();

    // We wait for the item to switch to change streaming, which happens after the inventory.
    let streaming = registry
        .notify_on_item_status(&job_id, 0, JobItemStatus::ExecuteIncrementalTask)
        .await;
    api.start_job(&job_id, &[]).await.unwrap();
    streaming.notified().await;

    let progress = api.job_progress(&job_id).await.unwrap();
    assert_eq!(progress[&0].inventory_records_count, 10);
    assert_eq!(progress[&0].inventory.len(), 4);
    assert!(progress[&0].inventory_finished());
    assert_eq!(t_order_statuses(&target).await, t_order_statuses(&source).await);

    // We change the source while the job streams.
    source
        .update_row(&t_order(), 5, vec![("status", Value::from("paid"))])
        .await
        .unwrap();
    source.delete_row(&t_order(), 3).await.unwrap();

    wait_until(|| async { t_order_statuses(&target).await == t_order_statuses(&source).await })
        .await;
    let statuses = t_order_statuses(&target).await;
    assert_eq!(statuses.len(), 9);
    assert!(statuses.contains(&(5, "paid".to_string())));
    assert!(!statuses.iter().any(|(order_id, _)| *order_id == 3));

    let results = api.check(&job_id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].matched);
    assert_eq!(results[0].source_records, 9);
    assert_eq!(results[0].target_records, 9);
    assert_eq!(api.check_result(&job_id).await.unwrap(), Some(results));

    api.commit_job(&job_id).await.unwrap();

    assert!(api.is_job_completed(&job_id).await.unwrap());
    let info = &api.list_jobs().await.unwrap()[0];
    assert!(!info.active);
    assert!(info.stop_time.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn changes_to_one_row_are_applied_in_commit_order() {
    init_test_tracing();
    let (dialect, source, target) = memory_dialect();
    seed_t_order(&source, 1..=2).await;

    let registry = NotifyingRegistry::new();
    let api = JobApi::new(dialect, registry.clone(), MemoryLockService::new());
    let job_id = api.create_job(job_config(1)).await.unwrap();

    let streaming = registry
        .notify_on_item_status(&job_id, 0, JobItemStatus::ExecuteIncrementalTask)
        .await;
    api.start_job(&job_id, &[]).await.unwrap();
    streaming.notified().await;

    source
        .insert_rows(&t_order(), vec![t_order_row(11, "new")])
        .await
        .unwrap();
    for status in ["paid", "shipped", "delivered"] {
        source
            .update_row(&t_order(), 11, vec![("status", Value::from(status))])
            .await
            .unwrap();
    }

    wait_until(|| async {
        target
            .row(&t_order(), 11)
            .await
            .is_some_and(|row| row.values[2] == Value::from("delivered"))
    })
    .await;

    source.delete_row(&t_order(), 11).await.unwrap();
    wait_until(|| async { target.row(&t_order(), 11).await.is_none() }).await;

    assert_eq!(t_order_statuses(&target).await, t_order_statuses(&source).await);

    api.stop_job(&job_id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn jobs_without_inventory_only_stream_new_changes() {
    init_test_tracing();
    let (dialect, source, target) = memory_dialect();
    seed_t_order(&source, 1..=5).await;

    let registry = NotifyingRegistry::new();
    let api = JobApi::new(dialect, registry.clone(), MemoryLockService::new());
    let mut config = job_config(1);
    config.full = false;
    let job_id = api.create_job(config).await.unwrap();

    let streaming = registry
        .notify_on_item_status(&job_id, 0, JobItemStatus::ExecuteIncrementalTask)
        .await;
    api.start_job(&job_id, &[]).await.unwrap();
    streaming.notified().await;

    assert!(target.has_table(&t_order()).await);
    assert!(t_order_statuses(&target).await.is_empty());

    source
        .insert_rows(&t_order(), vec![t_order_row(6, "new"), t_order_row(7, "new")])
        .await
        .unwrap();

    wait_until(|| async { t_order_statuses(&target).await.len() == 2 }).await;
    assert_eq!(
        t_order_statuses(&target).await,
        vec![(6, "new".to_string()), (7, "new".to_string())]
    );
    assert_eq!(api.job_progress(&job_id).await.unwrap()[&0].inventory_records_count, 0);

    api.stop_job(&job_id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn restarted_jobs_resume_streaming_without_preparing_again() {
    init_test_tracing();
    let (dialect, source, target) = memory_dialect();
    seed_t_order(&source, 1..=10).await;

    let registry = NotifyingRegistry::new();
    let api = JobApi::new(dialect, registry.clone(), MemoryLockService::new());
    let job_id = api.create_job(job_config(1)).await.unwrap();

    let streaming = registry
        .notify_on_item_status(&job_id, 0, JobItemStatus::ExecuteIncrementalTask)
        .await;
    api.start_job(&job_id, &[]).await.unwrap();
    streaming.notified().await;
    api.stop_job(&job_id).await.unwrap();

    let stopped = api.job_progress(&job_id).await.unwrap().remove(&0).unwrap();
    assert_eq!(stopped.status, JobItemStatus::ExecuteIncrementalTask);
    assert!(stopped.incremental.position.is_some());

    // Changes made while the job is stopped are picked up from the persisted checkpoint.
    source
        .update_row(&t_order(), 7, vec![("status", Value::from("paid"))])
        .await
        .unwrap();
    api.start_job(&job_id, &[]).await.unwrap();

    wait_until(|| async { t_order_statuses(&target).await == t_order_statuses(&source).await })
        .await;
    assert_eq!(target.ddl_statements().await, 1);
    let progress = api.job_progress(&job_id).await.unwrap();
    assert_eq!(progress[&0].inventory_records_count, 10);
    assert!(progress[&0].inventory_finished());

    api.stop_job(&job_id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn items_copy_their_own_tables_and_share_preparation() {
    init_test_tracing();
    let (dialect, source, target) = memory_dialect();
    seed_t_order(&source, 1..=6).await;
    let t_order_1 = TableName::parse("t_order_1");
    source
        .create_table(t_order_schema().renamed(t_order_1.clone()))
        .await;
    source
        .insert_rows(&t_order_1, (100..105).map(|id| t_order_row(id, "new")).collect())
        .await
        .unwrap();

    let registry = NotifyingRegistry::new();
    let api = JobApi::new(dialect, registry.clone(), MemoryLockService::new());
    let job_id = api.create_job(job_config(2)).await.unwrap();

    let mut streaming = Vec::new();
    for item in 0..2 {
        streaming.push(
            registry
                .notify_on_item_status(&job_id, item, JobItemStatus::ExecuteIncrementalTask)
                .await,
        );
    }
    api.start_job(&job_id, &[]).await.unwrap();
    for notify in &streaming {
        notify.notified().await;
    }

    // The target tables are created once for the whole job.
    assert_eq!(target.ddl_statements().await, 2);
    assert_eq!(target.rows(&t_order()).await.len(), 6);
    assert_eq!(target.rows(&t_order_1).await.len(), 5);

    let progress = api.job_progress(&job_id).await.unwrap();
    assert_eq!(progress[&0].inventory_records_count, 6);
    assert_eq!(progress[&1].inventory_records_count, 5);

    let results = api.check(&job_id).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|result| result.matched));

    api.stop_job(&job_id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn check_reports_the_first_mismatched_row() {
    init_test_tracing();
    let (dialect, source, target) = memory_dialect();
    seed_t_order(&source, 1..=5).await;
    seed_t_order(&target, 1..=5).await;
    target
        .update_row(&t_order(), 4, vec![("status", Value::from("lost"))])
        .await
        .unwrap();

    let api = JobApi::new(dialect, NotifyingRegistry::new(), MemoryLockService::new());
    let job_id = api.create_job(job_config(1)).await.unwrap();

    let results = api.check(&job_id).await.unwrap();

    assert!(!results[0].matched);
    let mismatch = results[0].first_mismatch.as_ref().unwrap();
    assert_eq!(mismatch.key, Some(4));
    let err = api.commit_job(&job_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConsistencyCheckNotPassed);
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_jobs_leave_nothing_behind() {
    init_test_tracing();
    let (dialect, source, _target) = memory_dialect();
    seed_t_order(&source, 1..=3).await;

    let registry = NotifyingRegistry::new();
    let api = JobApi::new(dialect, registry.clone(), MemoryLockService::new());
    let job_id = api.create_job(job_config(1)).await.unwrap();

    let streaming = registry
        .notify_on_item_status(&job_id, 0, JobItemStatus::ExecuteIncrementalTask)
        .await;
    api.start_job(&job_id, &[]).await.unwrap();
    streaming.notified().await;

    api.drop_job(&job_id).await.unwrap();

    assert!(api.list_jobs().await.unwrap().is_empty());
    assert!(registry.inner().keys().await.is_empty());
    let err = api.job_progress(&job_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::JobNotFound);
}

#[tokio::test(flavor = "multi_thread")]
async fn jobs_cannot_start_twice_in_one_process() {
    init_test_tracing();
    let (dialect, source, _target) = memory_dialect();
    seed_t_order(&source, 1..=3).await;

    let api = JobApi::new(dialect, NotifyingRegistry::new(), MemoryLockService::new());
    let job_id = api.create_job(job_config(1)).await.unwrap();

    api.start_job(&job_id, &[]).await.unwrap();
    let err = api.start_job(&job_id, &[]).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidJobState);
    let info = &api.list_jobs().await.unwrap()[0];
    assert!(info.active);
    assert_eq!(info.tables, vec!["t_order:t_order".to_string()]);

    api.stop_job(&job_id).await.unwrap();
}
