use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::bail;
use chrono::Utc;
use config::shared::{CoordinationConfig, DataSourceConfig, MigratorConfig};
use migration::coordination::{
    LockService, MemoryLockService, MemoryRegistry, PgLockService, PgRegistry, Registry,
    connect_coordination_pool,
};
use migration::dialect::Dialect;
use migration::dialect::memory::{MemoryDatabase, MemoryDialect};
use migration::dialect::postgres::PgDialect;
use migration::error::ErrorKind;
use migration::job::{Job, JobApi, generate_job_id};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

/// Connections kept by the coordination pool: progress persisters, barriers and one lock per
/// concurrently preparing item.
const COORDINATION_POOL_CONNECTIONS: u32 = 4;

// Runs the job with every combination of dialect and coordination backend.
macro_rules! run_job_dispatch {
    ($config:expr, $dialect:expr, $coordination:expr) => {{
        match $coordination {
            CoordinationConfig::Memory => {
                run_job($config, $dialect, MemoryRegistry::new(), MemoryLockService::new()).await
            }
            CoordinationConfig::Postgres(pg_config) => {
                let pool = connect_coordination_pool(
                    pg_config,
                    COORDINATION_POOL_CONNECTIONS,
                    Duration::from_millis($config.job.process.connect_timeout_ms),
                )
                .await?;
                let registry = PgRegistry::new(pool.clone());
                registry.migrate().await?;

                run_job($config, $dialect, registry, PgLockService::new(pool)).await
            }
        }
    }};
}

pub async fn start_migrator(config: MigratorConfig) -> anyhow::Result<()> {
    let source_kind = data_source_kind(&config, &config.job.source)?;
    let target_kind = data_source_kind(&config, &config.job.target)?;
    if source_kind != target_kind {
        bail!(
            "source `{}` is a {source_kind} data source but target `{}` is a {target_kind} data source",
            config.job.source,
            config.job.target
        );
    }

    info!(
        dialect = source_kind,
        items = ?config.assigned_items(),
        "starting migrator"
    );

    match source_kind {
        "postgres" => {
            let dialect = PgDialect::from_config(&config.data_sources, &config.job.process);
            run_job_dispatch!(&config, dialect, &config.coordination)
        }
        _ => {
            let dialect = memory_dialect(&config.data_sources);
            run_job_dispatch!(&config, dialect, &config.coordination)
        }
    }
}

fn data_source_kind(config: &MigratorConfig, name: &str) -> anyhow::Result<&'static str> {
    match config.data_sources.get(name) {
        Some(data_source) => Ok(data_source.dialect_name()),
        None => bail!("data source `{name}` is not configured"),
    }
}

/// Registers an empty database per distinct memory data source name.
fn memory_dialect(data_sources: &BTreeMap<String, DataSourceConfig>) -> MemoryDialect {
    let dialect = MemoryDialect::new();
    let mut databases: BTreeMap<&str, MemoryDatabase> = BTreeMap::new();
    for (data_source, config) in data_sources {
        if let DataSourceConfig::Memory { name } = config {
            let database = databases.entry(name.as_str()).or_default().clone();
            dialect.register(data_source.clone(), database);
        }
    }

    dialect
}

/// Creates the job when it does not exist yet and runs the assigned items until they exit.
async fn run_job<D, R, L>(
    config: &MigratorConfig,
    dialect: D,
    registry: R,
    lock_service: L,
) -> anyhow::Result<()>
where
    D: Dialect,
    R: Registry,
    L: LockService,
{
    let api = JobApi::new(dialect.clone(), registry, lock_service.clone());
    let job_id = match api.create_job(config.job.clone()).await {
        Ok(job_id) => job_id,
        Err(err) if err.kind() == ErrorKind::DuplicateJobId => {
            let job_id = existing_job_id(config);
            info!(job_id = %job_id, "job already exists, resuming it");
            job_id
        }
        Err(err) => return Err(err.into()),
    };

    let repository = api.repository().clone();
    let Some(job_config) = repository.load_config(&job_id).await? else {
        bail!("job `{job_id}` has no persisted configuration");
    };
    let mut info = match repository.load_info(&job_id).await? {
        Some(info) => info,
        None => bail!("job `{job_id}` has no persisted info"),
    };

    let mut job = Job::new(job_id.clone(), job_config, dialect, repository.clone(), lock_service);
    job.start(&config.assigned_items()).await?;

    info.active = true;
    info.stop_time = None;
    repository.persist_info(&info).await?;

    let shutdown_tx = job.shutdown_tx();
    let shutdown_handle = tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!(error = %err, "failed to register sigterm handler, waiting for ctrl+c only");
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("sigint (ctrl+c) received, stopping job");
                    shutdown_tx.shutdown();
                }
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("sigint (ctrl+c) received, stopping job");
            }
            _ = sigterm.recv() => {
                info!("sigterm received, stopping job");
            }
        }

        shutdown_tx.shutdown();
    });

    let result = job.wait().await;

    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    info.active = false;
    info.stop_time = Some(Utc::now());
    if let Err(err) = repository.persist_info(&info).await {
        warn!(job_id = %job_id, error = %err, "failed to mark job inactive");
    }

    result?;
    info!(job_id = %job_id, "migrator finished");

    Ok(())
}

fn existing_job_id(config: &MigratorConfig) -> String {
    match &config.job.job_id {
        Some(job_id) => job_id.clone(),
        None => generate_job_id(&config.job),
    }
}
