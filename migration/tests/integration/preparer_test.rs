use std::sync::Arc;
use std::time::Duration;

use config::shared::JobConfig;
use migration::concurrency::shutdown::{ShutdownResult, ShutdownTx, create_shutdown_channel};
use migration::coordination::{JobRepository, LockService, MemoryLockService, MemoryRegistry, keys};
use migration::dialect::memory::{MemoryDatabase, MemoryDialect};
use migration::error::ErrorKind;
use migration::job::JobItemContext;
use migration::preparer::{JobPreparer, PreparedTasks};
use migration::progress::{ItemProgress, JobItemProgress, JobItemStatus};
use migration::test_utils::job::{job_config, memory_dialect};
use migration::test_utils::table::{seed_t_order, t_order, t_order_row, t_order_schema};
use migration::types::TableName;
use telemetry::init_test_tracing;

const JOB_ID: &str = "j01preparer";

struct Fixture {
    dialect: MemoryDialect,
    source: MemoryDatabase,
    target: MemoryDatabase,
    repository: JobRepository<MemoryRegistry>,
    lock_service: MemoryLockService,
    config: Arc<JobConfig>,
}

impl Fixture {
    async fn new(sharding_total_count: u32) -> Self {
        let (dialect, source, target) = memory_dialect();
        seed_t_order(&source, 1..=4).await;
        for n in 1..sharding_total_count {
            let table = TableName::parse(&format!("t_order_{n}"));
            source.create_table(t_order_schema().renamed(table.clone())).await;
            source
                .insert_rows(&table, vec![t_order_row(i64::from(n), "new")])
                .await
                .unwrap();
        }

        let mut config = job_config(sharding_total_count);
        config.job_id = Some(JOB_ID.to_string());

        Self {
            dialect,
            source,
            target,
            repository: JobRepository::new(MemoryRegistry::new()),
            lock_service: MemoryLockService::new(),
            config: Arc::new(config),
        }
    }

    /// A fresh context for `item`, as a newly started process would build it.
    fn context(&self, item: u32) -> (JobItemContext<MemoryDialect, MemoryRegistry>, ShutdownTx) {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let context = JobItemContext::new(
            JOB_ID.to_string(),
            item,
            self.config.clone(),
            self.dialect.clone(),
            self.repository.clone(),
            ItemProgress::new(JobItemProgress::default()),
            shutdown_rx,
        );

        (context, shutdown_tx)
    }

    fn preparer(&self, lock_timeout: Duration) -> JobPreparer<MemoryLockService> {
        JobPreparer::new(self.lock_service.clone(), lock_timeout, Duration::from_secs(1))
    }

    async fn persisted(&self, item: u32) -> JobItemProgress {
        self.repository
            .load_progress(JOB_ID, item)
            .await
            .unwrap()
            .unwrap()
    }
}

fn into_tasks(
    prepared: ShutdownResult<PreparedTasks<MemoryDialect>, ()>,
) -> PreparedTasks<MemoryDialect> {
    match prepared {
        ShutdownResult::Ok(tasks) => tasks,
        ShutdownResult::Shutdown(()) => panic!("preparation was stopped"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn preparing_twice_creates_tables_once_and_keeps_the_start_position() {
    init_test_tracing();
    let fixture = Fixture::new(1).await;
    let preparer = fixture.preparer(Duration::from_secs(1));

    let (context, _shutdown_tx) = fixture.context(0);
    let tasks = into_tasks(preparer.prepare(&context).await.unwrap());
    assert_eq!(tasks.inventory.len(), 2);
    assert!(tasks.incremental.is_some());
    assert!(fixture.target.has_table(&t_order()).await);
    assert_eq!(fixture.target.ddl_statements().await, 1);

    let first = fixture.persisted(0).await;
    assert_eq!(first.status, JobItemStatus::PrepareSuccess);
    assert!(first.incremental.position.is_some());
    assert!(!fixture.lock_service.is_locked(&keys::lock(JOB_ID)));

    // Changes made between the two preparations must not move the start position.
    fixture
        .source
        .insert_rows(&t_order(), vec![t_order_row(5, "new")])
        .await
        .unwrap();

    let (context, _shutdown_tx) = fixture.context(0);
    let tasks = into_tasks(preparer.prepare(&context).await.unwrap());
    assert_eq!(tasks.task_config.start_position, first.incremental.position);
    assert_eq!(fixture.target.ddl_statements().await, 1);

    let second = fixture.persisted(0).await;
    assert_eq!(second.status, first.status);
    assert_eq!(second.incremental, first.incremental);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_items_prepare_the_job_once() {
    init_test_tracing();
    let fixture = Arc::new(Fixture::new(2).await);

    let mut handles = Vec::new();
    for item in 0..2 {
        let fixture = fixture.clone();
        handles.push(tokio::spawn(async move {
            let (context, _shutdown_tx) = fixture.context(item);
            let preparer = fixture.preparer(Duration::from_secs(5));
            into_tasks(preparer.prepare(&context).await.unwrap()).inventory.len()
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap() > 0);
    }

    assert_eq!(fixture.target.ddl_statements().await, 2);
    assert!(fixture.target.has_table(&TableName::parse("t_order_1")).await);
    for item in 0..2 {
        let progress = fixture.persisted(item).await;
        assert_eq!(progress.status, JobItemStatus::PrepareSuccess);
        assert!(progress.incremental.position.is_some());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn preparation_times_out_while_another_process_holds_the_lock() {
    init_test_tracing();
    let fixture = Fixture::new(1).await;

    // We take the job lock as another process would.
    let guard = fixture
        .lock_service
        .try_lock(&keys::lock(JOB_ID), Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    let (context, _shutdown_tx) = fixture.context(0);
    let err = fixture
        .preparer(Duration::from_millis(50))
        .prepare(&context)
        .await
        .err()
        .unwrap();

    assert_eq!(err.kind(), ErrorKind::LockTimeout);
    assert!(!fixture.target.has_table(&t_order()).await);

    fixture.lock_service.unlock(guard).await.unwrap();
    let tasks = into_tasks(
        fixture
            .preparer(Duration::from_millis(50))
            .prepare(&context)
            .await
            .unwrap(),
    );
    assert!(tasks.incremental.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_start_positions_are_captured_on_the_next_attempt() {
    init_test_tracing();
    let fixture = Fixture::new(1).await;
    let preparer = fixture.preparer(Duration::from_secs(1));
    fixture.source.set_fail_init_position(true).await;

    let (context, _shutdown_tx) = fixture.context(0);
    let err = preparer.prepare(&context).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::PositionAcquisitionFailed);

    // The tables are ready, only the position is missing.
    let persisted = fixture.persisted(0).await;
    assert_eq!(persisted.status, JobItemStatus::PrepareSuccess);
    assert_eq!(persisted.incremental.position, None);

    fixture.source.set_fail_init_position(false).await;
    let (context, _shutdown_tx) = fixture.context(0);
    let tasks = into_tasks(preparer.prepare(&context).await.unwrap());

    assert!(tasks.task_config.start_position.is_some());
    assert_eq!(fixture.target.ddl_statements().await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_table_creation_is_recorded_and_retried() {
    init_test_tracing();
    let fixture = Fixture::new(1).await;
    let preparer = fixture.preparer(Duration::from_secs(1));
    fixture.target.fail_next_ddl(1).await;

    let (context, _shutdown_tx) = fixture.context(0);
    let err = preparer.prepare(&context).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::SchemaPreparationFailed);

    let persisted = fixture.persisted(0).await;
    assert_eq!(persisted.status, JobItemStatus::PreparingFailure);
    assert!(persisted.error_message.is_some());

    let (context, _shutdown_tx) = fixture.context(0);
    into_tasks(preparer.prepare(&context).await.unwrap());

    assert!(fixture.target.has_table(&t_order()).await);
    assert_eq!(fixture.persisted(0).await.status, JobItemStatus::PrepareSuccess);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_sources_fail_before_the_lock_is_taken() {
    init_test_tracing();
    let fixture = Fixture::new(1).await;
    fixture.source.set_reachable(false).await;

    let (context, _shutdown_tx) = fixture.context(0);
    let err = fixture
        .preparer(Duration::from_secs(1))
        .prepare(&context)
        .await
        .err()
        .unwrap();

    assert_eq!(err.kind(), ErrorKind::SourceConnectionFailed);
    assert!(fixture.repository.load_progress(JOB_ID, 0).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn stopping_items_are_not_prepared() {
    init_test_tracing();
    let fixture = Fixture::new(1).await;

    let (context, shutdown_tx) = fixture.context(0);
    shutdown_tx.shutdown();
    let prepared = fixture
        .preparer(Duration::from_secs(1))
        .prepare(&context)
        .await
        .unwrap();

    assert!(matches!(prepared, ShutdownResult::Shutdown(())));
    assert!(!fixture.target.has_table(&t_order()).await);
}
