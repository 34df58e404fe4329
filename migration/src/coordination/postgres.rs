use std::time::Duration;

use config::shared::PgConnectionConfig;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row};
use tracing::{debug, warn};

use crate::coordination::registry::child_names;
use crate::coordination::{LockService, Registry};
use crate::error::{ErrorKind, MigrationResult};
use crate::migration_error;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn coordination_error(description: &'static str, err: sqlx::Error) -> crate::error::MigrationError {
    migration_error!(
        ErrorKind::CoordinationFailed,
        description,
        err.to_string(),
        source: err
    )
}

/// Connects a pool to the coordination database.
pub async fn connect_coordination_pool(
    config: &PgConnectionConfig,
    max_connections: u32,
    connect_timeout: Duration,
) -> MigrationResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(connect_timeout)
        .connect_with(config.connect_options())
        .await
        .map_err(|err| coordination_error("Could not connect to the coordination database", err))
}

/// Registry stored in the `migration_registry` table.
#[derive(Debug, Clone)]
pub struct PgRegistry {
    pool: PgPool,
}

impl PgRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the registry table if needed.
    pub async fn migrate(&self) -> MigrationResult<()> {
        sqlx::query(
            r#"
            create table if not exists migration_registry (
                key text primary key,
                value text not null,
                updated_at timestamptz not null default now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|err| coordination_error("Could not create the registry table", err))?;

        Ok(())
    }
}

impl Registry for PgRegistry {
    async fn put(&self, key: &str, value: String) -> MigrationResult<()> {
        sqlx::query(
            r#"
            insert into migration_registry (key, value, updated_at)
            values ($1, $2, now())
            on conflict (key) do update set value = excluded.value, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|err| coordination_error("Could not write registry key", err))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> MigrationResult<Option<String>> {
        let row = sqlx::query("select value from migration_registry where key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| coordination_error("Could not read registry key", err))?;

        row.map(|row| row.try_get::<String, _>("value"))
            .transpose()
            .map_err(|err| coordination_error("Could not decode registry value", err))
    }

    async fn delete_tree(&self, prefix: &str) -> MigrationResult<()> {
        let prefix = prefix.trim_end_matches('/');
        sqlx::query(
            "delete from migration_registry where key = $1 or left(key, length($1) + 1) = $1 || '/'",
        )
        .bind(prefix)
        .execute(&self.pool)
        .await
        .map_err(|err| coordination_error("Could not delete registry subtree", err))?;

        Ok(())
    }

    async fn children(&self, prefix: &str) -> MigrationResult<Vec<String>> {
        let prefix = prefix.trim_end_matches('/');
        let rows = sqlx::query(
            "select key from migration_registry where left(key, length($1) + 1) = $1 || '/'",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| coordination_error("Could not list registry children", err))?;

        let keys = rows
            .iter()
            .map(|row| row.try_get::<String, _>("key"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| coordination_error("Could not decode registry key", err))?;

        Ok(child_names(prefix, keys.iter().map(String::as_str)))
    }
}

/// Session-level advisory locks.
///
/// Each held lock pins one pooled connection. The server releases the lock when that session
/// ends, so a crashed holder cannot keep a job locked.
#[derive(Debug, Clone)]
pub struct PgLockService {
    pool: PgPool,
}

impl PgLockService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Maps a lock name onto the advisory lock key space.
fn advisory_key(name: &str) -> i64 {
    let digest = blake3::hash(name.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    i64::from_be_bytes(prefix)
}

/// Holds an advisory lock on a dedicated connection.
#[derive(Debug)]
pub struct PgLockGuard {
    key: i64,
    connection: Option<PoolConnection<Postgres>>,
}

impl Drop for PgLockGuard {
    fn drop(&mut self) {
        // Closing the session is the only way to release the lock without awaiting.
        if let Some(mut connection) = self.connection.take() {
            connection.close_on_drop();
        }
    }
}

impl LockService for PgLockService {
    type Guard = PgLockGuard;

    async fn try_lock(&self, name: &str, timeout: Duration) -> MigrationResult<Option<PgLockGuard>> {
        let key = advisory_key(name);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut connection = self
            .pool
            .acquire()
            .await
            .map_err(|err| coordination_error("Could not acquire a lock connection", err))?;
        // Advisory locks belong to the session, so a lock connection is never reused.
        connection.close_on_drop();

        loop {
            let acquired: bool = sqlx::query_scalar("select pg_try_advisory_lock($1)")
                .bind(key)
                .fetch_one(&mut *connection)
                .await
                .map_err(|err| coordination_error("Could not try the advisory lock", err))?;

            if acquired {
                debug!(name, key, "advisory lock acquired");
                return Ok(Some(PgLockGuard {
                    key,
                    connection: Some(connection),
                }));
            }

            if tokio::time::Instant::now() + LOCK_POLL_INTERVAL > deadline {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn unlock(&self, mut guard: PgLockGuard) -> MigrationResult<()> {
        let Some(mut connection) = guard.connection.take() else {
            return Ok(());
        };

        let released: Result<bool, _> = sqlx::query_scalar("select pg_advisory_unlock($1)")
            .bind(guard.key)
            .fetch_one(&mut *connection)
            .await;

        match released {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(key = guard.key, "advisory lock was not held at unlock");
                Ok(())
            }
            Err(err) => {
                connection.close_on_drop();
                Err(coordination_error("Could not release the advisory lock", err))
            }
        }
    }
}
