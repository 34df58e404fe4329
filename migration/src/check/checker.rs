use std::cmp::Ordering;
use std::ops::Bound;

use tracing::{debug, info};

use crate::check::{ConsistencyCheckResult, Mismatch};
use crate::dialect::{Dumper, RangeQuery};
use crate::error::MigrationResult;
use crate::task::TableTaskConfig;
use crate::types::TableRow;

/// Compares the rows of a source table with the rows of its target table.
///
/// Keyed tables are walked in key order, chunk by chunk, comparing a digest of each chunk
/// and falling back to a row by row comparison to name the first differing key. Tables
/// without an integer unique key are compared by row count and an order independent digest.
#[derive(Debug, Clone, Copy)]
pub struct ConsistencyChecker {
    chunk_size: usize,
    compare_unkeyed: bool,
}

impl ConsistencyChecker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            compare_unkeyed: true,
        }
    }

    /// Whether tables without a unique key are compared. Skipped tables are reported ignored.
    pub fn with_compare_unkeyed(mut self, compare_unkeyed: bool) -> Self {
        self.compare_unkeyed = compare_unkeyed;
        self
    }

    pub async fn check_table<S: Dumper>(
        &self,
        source: &S,
        target: &S,
        table: &TableTaskConfig,
    ) -> MigrationResult<ConsistencyCheckResult> {
        let name = table.target_table.to_string();

        let Some(target_schema) = target.table_schema(&table.target_table).await? else {
            return Ok(ConsistencyCheckResult {
                table: name,
                matched: false,
                source_records: source.count_rows(&table.source_table).await?,
                target_records: 0,
                first_mismatch: Some(Mismatch {
                    key: None,
                    reason: "target table does not exist".to_string(),
                }),
                ignored: false,
            });
        };

        let source_records = source.count_rows(&table.source_table).await?;
        let target_records = target.count_rows(&table.target_table).await?;

        let key_columns = table.unique_key.as_deref().and_then(|key| {
            let source_index = table.source_schema.columns.iter().position(|c| c.name == key)?;
            let target_index = target_schema.columns.iter().position(|c| c.name == key)?;
            Some((key, source_index, target_index))
        });

        let first_mismatch = match key_columns {
            Some((key, source_index, target_index)) => {
                self.compare_keyed(source, target, table, key, source_index, target_index)
                    .await?
            }
            None if !self.compare_unkeyed => {
                info!(table = %name, "table without unique key ignored");
                return Ok(ConsistencyCheckResult::ignored(name));
            }
            None => self.compare_unkeyed(source, target, table).await?,
        };

        let first_mismatch = first_mismatch.or_else(|| {
            (source_records != target_records).then(|| Mismatch {
                key: None,
                reason: format!("source has {source_records} rows, target has {target_records}"),
            })
        });
        let matched = first_mismatch.is_none();

        info!(table = %name, matched, source_records, target_records, "table checked");

        Ok(ConsistencyCheckResult {
            table: name,
            matched,
            source_records,
            target_records,
            first_mismatch,
            ignored: false,
        })
    }

    async fn compare_keyed<S: Dumper>(
        &self,
        source: &S,
        target: &S,
        table: &TableTaskConfig,
        key: &str,
        source_index: usize,
        target_index: usize,
    ) -> MigrationResult<Option<Mismatch>> {
        let mut lower = Bound::Unbounded;
        loop {
            let source_rows = source
                .dump_range(RangeQuery {
                    table: &table.source_table,
                    key,
                    lower,
                    upper: Bound::Unbounded,
                    limit: Some(self.chunk_size),
                })
                .await?;

            let Some(last) = source_rows.last().and_then(|row| row.key_at(source_index)) else {
                // Anything left in the target has no source counterpart.
                let extra = target
                    .dump_range(RangeQuery {
                        table: &table.target_table,
                        key,
                        lower,
                        upper: Bound::Unbounded,
                        limit: Some(1),
                    })
                    .await?;

                return Ok(extra.first().map(|row| Mismatch {
                    key: row.key_at(target_index),
                    reason: "row missing from source".to_string(),
                }));
            };

            let target_rows = target
                .dump_range(RangeQuery {
                    table: &table.target_table,
                    key,
                    lower,
                    upper: Bound::Included(last),
                    limit: None,
                })
                .await?;

            if source_rows.len() != target_rows.len() || digest(&source_rows) != digest(&target_rows) {
                debug!(table = %table.target_table, last, "chunk digests differ");
                return Ok(first_difference(
                    &source_rows,
                    source_index,
                    &target_rows,
                    target_index,
                ));
            }

            if source_rows.len() < self.chunk_size {
                lower = Bound::Excluded(last);
                let extra = target
                    .dump_range(RangeQuery {
                        table: &table.target_table,
                        key,
                        lower,
                        upper: Bound::Unbounded,
                        limit: Some(1),
                    })
                    .await?;

                return Ok(extra.first().map(|row| Mismatch {
                    key: row.key_at(target_index),
                    reason: "row missing from source".to_string(),
                }));
            }

            lower = Bound::Excluded(last);
        }
    }

    async fn compare_unkeyed<S: Dumper>(
        &self,
        source: &S,
        target: &S,
        table: &TableTaskConfig,
    ) -> MigrationResult<Option<Mismatch>> {
        let source_digest = self.unordered_digest(source, table, true).await?;
        let target_digest = self.unordered_digest(target, table, false).await?;

        if source_digest != target_digest {
            return Ok(Some(Mismatch {
                key: None,
                reason: "table digests differ".to_string(),
            }));
        }

        Ok(None)
    }

    /// Sum of per-row hashes, independent of scan order.
    async fn unordered_digest<S: Dumper>(
        &self,
        data_source: &S,
        table: &TableTaskConfig,
        is_source: bool,
    ) -> MigrationResult<(u64, u64)> {
        let name = if is_source {
            &table.source_table
        } else {
            &table.target_table
        };

        let mut offset = 0u64;
        let mut count = 0u64;
        let mut sum = 0u64;
        let mut buffer = Vec::new();
        loop {
            let rows = data_source
                .dump_sequential(name, offset, self.chunk_size)
                .await?;
            for row in &rows {
                buffer.clear();
                row.encode_canonical(&mut buffer);
                sum = sum.wrapping_add(row_hash(&buffer));
            }

            count += rows.len() as u64;
            offset += rows.len() as u64;
            if rows.len() < self.chunk_size {
                return Ok((count, sum));
            }
        }
    }
}

fn digest(rows: &[TableRow]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = Vec::new();
    for row in rows {
        buffer.clear();
        row.encode_canonical(&mut buffer);
        hasher.update(&buffer);
    }

    hasher.finalize()
}

fn row_hash(encoded: &[u8]) -> u64 {
    let hash = blake3::hash(encoded);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_be_bytes(prefix)
}

/// Merges two key-ordered chunks and returns the first key that differs.
fn first_difference(
    source: &[TableRow],
    source_index: usize,
    target: &[TableRow],
    target_index: usize,
) -> Option<Mismatch> {
    let mut source_rows = source.iter().peekable();
    let mut target_rows = target.iter().peekable();
    let mut source_buffer = Vec::new();
    let mut target_buffer = Vec::new();

    loop {
        let (source_row, target_row) = match (source_rows.peek(), target_rows.peek()) {
            (None, None) => return None,
            (Some(row), None) => {
                return Some(Mismatch {
                    key: row.key_at(source_index),
                    reason: "row missing from target".to_string(),
                });
            }
            (None, Some(row)) => {
                return Some(Mismatch {
                    key: row.key_at(target_index),
                    reason: "row missing from source".to_string(),
                });
            }
            (Some(source_row), Some(target_row)) => (*source_row, *target_row),
        };

        let source_key = source_row.key_at(source_index);
        let target_key = target_row.key_at(target_index);
        match source_key.cmp(&target_key) {
            Ordering::Less => {
                return Some(Mismatch {
                    key: source_key,
                    reason: "row missing from target".to_string(),
                });
            }
            Ordering::Greater => {
                return Some(Mismatch {
                    key: target_key,
                    reason: "row missing from source".to_string(),
                });
            }
            Ordering::Equal => {
                source_buffer.clear();
                target_buffer.clear();
                source_row.encode_canonical(&mut source_buffer);
                target_row.encode_canonical(&mut target_buffer);
                if source_buffer != target_buffer {
                    return Some(Mismatch {
                        key: source_key,
                        reason: "row values differ".to_string(),
                    });
                }
            }
        }

        source_rows.next();
        target_rows.next();
    }
}
