use std::sync::Arc;

use metrics::counter;
use tracing::{debug, info};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::dialect::{Dialect, Dumper, Importer, RangeQuery};
use crate::error::{ErrorKind, MigrationResult};
#[cfg(feature = "failpoints")]
use crate::failpoints::{INVENTORY__BEFORE_WRITE_BATCH, migration_fail_point};
use crate::metrics::{ITEM_LABEL, JOB_ID_LABEL, MIGRATION_INVENTORY_RECORDS_TOTAL, TABLE_NAME_LABEL};
use crate::position::InventoryPosition;
use crate::progress::ItemProgress;
use crate::rate_limit::RateLimiter;
use crate::splitter::InventoryChunk;
use crate::task::retry::with_retries;
use crate::task::{DumperConfig, ImporterConfig};
use crate::types::{DataRecord, TableRow};

/// Result of an inventory task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryTaskResult {
    /// Every row of the chunk was copied.
    Completed { copied: u64 },
    /// The task observed a stop request between two batches.
    Stopped,
}

/// Copies the rows of one [`InventoryChunk`] from the source to the target in key order.
///
/// The chunk position advances only after a batch is written, so a restarted task copies
/// exactly the rows after the last written key.
pub struct InventoryTask<D: Dialect> {
    job_id: String,
    item: u32,
    chunk: InventoryChunk,
    source: D::Source,
    target: D::Target,
    dumper: DumperConfig,
    importer: ImporterConfig,
    progress: Arc<ItemProgress>,
    rate_limiter: Option<RateLimiter>,
}

impl<D: Dialect> InventoryTask<D> {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        job_id: String,
        item: u32,
        chunk: InventoryChunk,
        source: D::Source,
        target: D::Target,
        dumper: DumperConfig,
        importer: ImporterConfig,
        progress: Arc<ItemProgress>,
        rate_limiter: Option<RateLimiter>,
    ) -> Self {
        Self {
            job_id,
            item,
            chunk,
            source,
            target,
            dumper,
            importer,
            progress,
            rate_limiter,
        }
    }

    pub fn chunk(&self) -> &InventoryChunk {
        &self.chunk
    }

    pub async fn run(self, shutdown_rx: ShutdownRx) -> MigrationResult<InventoryTaskResult> {
        let table = self.chunk.table.clone();
        let mut position = self.chunk.position;
        if position.is_finished() {
            debug!(chunk = %self.chunk.id, "chunk already finished");
            return Ok(InventoryTaskResult::Completed { copied: 0 });
        }

        let key = table.unique_key.as_deref();
        let key_index = match (key, position) {
            (Some(key), InventoryPosition::Range { .. }) => {
                match table.source_schema.columns.iter().position(|c| c.name == key) {
                    Some(index) => Some(index),
                    None => bail!(
                        ErrorKind::MissingUniqueKey,
                        "Unique key column is missing from the source table",
                        format!("column `{key}` of table {}", table.source_table)
                    ),
                }
            }
            (None, InventoryPosition::Range { .. }) => bail!(
                ErrorKind::MissingUniqueKey,
                "A key range chunk requires a unique key",
                format!("chunk {}", self.chunk.id)
            ),
            _ => None,
        };

        info!(
            job_id = %self.job_id,
            item = self.item,
            chunk = %self.chunk.id,
            %position,
            "starting inventory task"
        );

        let batch_size = self.dumper.batch_size.max(1);
        let mut offset = 0u64;
        let mut copied = 0u64;

        loop {
            if shutdown_rx.is_shutdown() {
                info!(chunk = %self.chunk.id, copied, "inventory task stopped");
                return Ok(InventoryTaskResult::Stopped);
            }

            let rows = match self.read_batch(position, offset, batch_size, &shutdown_rx).await? {
                ShutdownResult::Ok(rows) => rows,
                ShutdownResult::Shutdown(_) => return Ok(InventoryTaskResult::Stopped),
            };
            if rows.is_empty() {
                break;
            }

            let row_count = rows.len();
            let last_key = match key_index {
                Some(index) => match rows.last().and_then(|row| row.key_at(index)) {
                    Some(last_key) => Some(last_key),
                    None => bail!(
                        ErrorKind::MissingUniqueKey,
                        "Unique key value is not an integer",
                        format!("table {}", table.source_table)
                    ),
                },
                None => None,
            };

            let records: Vec<DataRecord> = rows
                .into_iter()
                .map(|row| {
                    DataRecord::from_row(table.target_table.clone(), &table.source_schema, key, row)
                })
                .collect();

            if let Some(rate_limiter) = &self.rate_limiter {
                rate_limiter.acquire(records.len()).await;
            }

            if self.write_batch(&records, &shutdown_rx).await?.should_shutdown() {
                return Ok(InventoryTaskResult::Stopped);
            }

            match last_key {
                Some(last_key) => position.advance(last_key)?,
                None => offset += row_count as u64,
            }
            copied += row_count as u64;

            self.progress.add_processed(row_count as u64);
            self.progress
                .set_inventory_position(&self.chunk.id, position)
                .await;
            counter!(
                MIGRATION_INVENTORY_RECORDS_TOTAL,
                JOB_ID_LABEL => self.job_id.clone(),
                ITEM_LABEL => self.item.to_string(),
                TABLE_NAME_LABEL => table.target_table.to_string(),
            )
            .increment(row_count as u64);

            if row_count < batch_size {
                break;
            }
        }

        self.progress
            .set_inventory_position(&self.chunk.id, InventoryPosition::Finished)
            .await;

        info!(chunk = %self.chunk.id, copied, "inventory task completed");

        Ok(InventoryTaskResult::Completed { copied })
    }

    async fn read_batch(
        &self,
        position: InventoryPosition,
        offset: u64,
        batch_size: usize,
        shutdown_rx: &ShutdownRx,
    ) -> MigrationResult<ShutdownResult<Vec<TableRow>, ()>> {
        let table = &self.chunk.table;
        let source = &self.source;

        with_retries(&self.importer.retry, shutdown_rx, "inventory read", || async move {
            match (position, table.unique_key.as_deref()) {
                (InventoryPosition::Range { .. }, Some(key)) => {
                    source
                        .dump_range(RangeQuery {
                            table: &table.source_table,
                            key,
                            lower: position.resume_lower_bound(),
                            upper: position.upper_bound(),
                            limit: Some(batch_size),
                        })
                        .await
                }
                _ => {
                    source
                        .dump_sequential(&table.source_table, offset, batch_size)
                        .await
                }
            }
        })
        .await
    }

    async fn write_batch(
        &self,
        records: &[DataRecord],
        shutdown_rx: &ShutdownRx,
    ) -> MigrationResult<ShutdownResult<(), ()>> {
        let target = &self.target;

        with_retries(&self.importer.retry, shutdown_rx, "inventory write", || async move {
            #[cfg(feature = "failpoints")]
            migration_fail_point(INVENTORY__BEFORE_WRITE_BATCH)?;

            target.write(records).await
        })
        .await
    }
}
