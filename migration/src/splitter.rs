//! Partitions tables into independently resumable inventory chunks.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::dialect::{Dumper, KeyRange};
use crate::error::MigrationResult;
use crate::position::InventoryPosition;
use crate::task::TableTaskConfig;

/// Upper bound of chunks per table. Larger key ranges get wider chunks.
pub const MAX_CHUNKS_PER_TABLE: u64 = 10_000;

/// A key range of one table, copied by one inventory task.
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryChunk {
    /// Deterministic id, `{target_table}#{index}`.
    pub id: String,
    pub table: Arc<TableTaskConfig>,
    pub position: InventoryPosition,
}

pub fn chunk_id(table: &TableTaskConfig, index: usize) -> String {
    format!("{}#{index}", table.target_table)
}

/// Splits tables into chunks, or rebuilds the chunks of a previous run.
#[derive(Debug, Clone, Copy)]
pub struct InventoryTaskSplitter {
    chunk_size: u64,
}

impl InventoryTaskSplitter {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1) as u64,
        }
    }

    /// Splits `[range.min, range.max]` into contiguous `[lower, upper)` chunks.
    ///
    /// The last chunk ends at `max + 1`, or is open when that overflows. An empty table yields
    /// one finished chunk.
    pub fn split(&self, range: Option<KeyRange>) -> Vec<InventoryPosition> {
        let Some(range) = range else {
            return vec![InventoryPosition::Finished];
        };

        let min = i128::from(range.min);
        let max = i128::from(range.max);
        let span = (max - min + 1) as u128;
        let widened = span.div_ceil(u128::from(MAX_CHUNKS_PER_TABLE));
        let step = u128::from(self.chunk_size).max(widened) as i128;

        let mut positions = Vec::new();
        let mut lower = min;
        while lower <= max {
            let upper = (lower + step).min(max + 1);
            positions.push(InventoryPosition::range(
                lower as i64,
                i64::try_from(upper).ok(),
            ));
            lower = upper;
        }

        positions
    }

    /// Returns the chunks of `table`.
    ///
    /// Persisted chunk positions win over a fresh split, so a restarted item resumes exactly
    /// where it stopped and sees the same chunk boundaries. Keys above the last persisted
    /// chunk get new chunks, so a chunk map saved only in part never drops rows.
    pub async fn split_table<D: Dumper>(
        &self,
        dumper: &D,
        table: Arc<TableTaskConfig>,
        persisted: &BTreeMap<String, InventoryPosition>,
    ) -> MigrationResult<Vec<InventoryChunk>> {
        let prefix = format!("{}#", table.target_table);
        let mut resumed: Vec<(usize, InventoryPosition)> = persisted
            .iter()
            .filter_map(|(id, position)| {
                let index = id.strip_prefix(&prefix)?.parse::<usize>().ok()?;
                Some((index, *position))
            })
            .collect();
        resumed.sort_by_key(|(index, _)| *index);

        let Some(&(last_index, last_position)) = resumed.last() else {
            let positions = match &table.unique_key {
                Some(key) => {
                    let range = dumper.key_range(&table.source_table, key).await?;
                    self.split(range)
                }
                None => vec![InventoryPosition::Unsplit],
            };
            debug!(table = %table.target_table, chunks = positions.len(), "table split");

            return Ok(chunks(&table, positions.into_iter().enumerate()));
        };

        let mut positions = resumed;
        if let (Some(key), InventoryPosition::Range { upper: Some(upper), .. }) =
            (&table.unique_key, last_position)
            && let Some(range) = dumper.key_range(&table.source_table, key).await?
            && range.max >= upper
        {
            let tail = self.split(Some(KeyRange {
                min: upper,
                max: range.max,
            }));
            debug!(table = %table.target_table, from = upper, chunks = tail.len(), "splitting keys above the persisted chunks");
            positions.extend(
                tail.into_iter()
                    .enumerate()
                    .map(|(offset, position)| (last_index + 1 + offset, position)),
            );
        }
        debug!(table = %table.target_table, chunks = positions.len(), "resuming persisted chunks");

        Ok(chunks(&table, positions))
    }
}

fn chunks(
    table: &Arc<TableTaskConfig>,
    positions: impl IntoIterator<Item = (usize, InventoryPosition)>,
) -> Vec<InventoryChunk> {
    positions
        .into_iter()
        .map(|(index, position)| InventoryChunk {
            id: chunk_id(table, index),
            table: table.clone(),
            position,
        })
        .collect()
}
