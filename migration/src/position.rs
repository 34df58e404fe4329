//! Checkpoint markers for inventory and incremental progress.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::bail;
use crate::error::{ErrorKind, MigrationError, MigrationResult};

/// A Postgres write-ahead log location, rendered as `X/Y`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((high, low)) = s.split_once('/') else {
            bail!(
                ErrorKind::InvalidPosition,
                "Invalid log sequence number",
                format!("expected `X/Y`, got `{s}`")
            );
        };

        let parse = |part: &str| {
            u32::from_str_radix(part, 16).map_err(|err| {
                crate::migration_error!(
                    ErrorKind::InvalidPosition,
                    "Invalid log sequence number",
                    format!("`{s}`: {err}")
                )
            })
        };

        Ok(Lsn((u64::from(parse(high)?) << 32) | u64::from(parse(low)?)))
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Where change capture resumes from.
///
/// Positions are only comparable within one source kind.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum IncrementalPosition {
    /// A change of the transaction committed at `commit`. `index` orders the changes inside it.
    Lsn { commit: Lsn, index: u32 },
    /// Sequence number in the change log of an in-process database.
    Sequence(u64),
}

impl PartialOrd for IncrementalPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (
                IncrementalPosition::Lsn { commit, index },
                IncrementalPosition::Lsn {
                    commit: other_commit,
                    index: other_index,
                },
            ) => (commit, index).partial_cmp(&(other_commit, other_index)),
            (IncrementalPosition::Sequence(a), IncrementalPosition::Sequence(b)) => {
                a.partial_cmp(b)
            }
            _ => None,
        }
    }
}

impl IncrementalPosition {
    /// Position covering every change of transactions committed up to `commit`.
    pub fn after_commit(commit: Lsn) -> Self {
        IncrementalPosition::Lsn {
            commit,
            index: u32::MAX,
        }
    }

    /// Returns whether an event at `self` was already applied when resuming from `checkpoint`.
    ///
    /// Positions of another source kind are an error since the stream cannot be resumed safely.
    pub fn is_covered_by(&self, checkpoint: &IncrementalPosition) -> MigrationResult<bool> {
        match self.partial_cmp(checkpoint) {
            Some(ordering) => Ok(ordering != Ordering::Greater),
            None => bail!(
                ErrorKind::InvalidPosition,
                "Incremental positions are not comparable",
                format!("event position {self} cannot be compared with checkpoint {checkpoint}")
            ),
        }
    }
}

impl fmt::Display for IncrementalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncrementalPosition::Lsn { commit, index } => write!(f, "lsn({commit}#{index})"),
            IncrementalPosition::Sequence(sequence) => write!(f, "seq({sequence})"),
        }
    }
}

/// Progress of one inventory chunk.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum InventoryPosition {
    /// A key range. `lower` is inclusive, `upper` exclusive or open, `last` is the last copied key.
    Range {
        lower: i64,
        upper: Option<i64>,
        last: Option<i64>,
    },
    /// The whole table, copied in one sequential scan.
    Unsplit,
    Finished,
}

impl InventoryPosition {
    pub fn range(lower: i64, upper: Option<i64>) -> Self {
        InventoryPosition::Range {
            lower,
            upper,
            last: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, InventoryPosition::Finished)
    }

    /// Lower bound of the rows still to copy.
    pub fn resume_lower_bound(&self) -> Bound<i64> {
        match self {
            InventoryPosition::Range {
                last: Some(last), ..
            } => Bound::Excluded(*last),
            InventoryPosition::Range { lower, .. } => Bound::Included(*lower),
            InventoryPosition::Unsplit | InventoryPosition::Finished => Bound::Unbounded,
        }
    }

    pub fn upper_bound(&self) -> Bound<i64> {
        match self {
            InventoryPosition::Range {
                upper: Some(upper), ..
            } => Bound::Excluded(*upper),
            _ => Bound::Unbounded,
        }
    }

    /// Records `key` as copied. Keys never move backwards.
    pub fn advance(&mut self, key: i64) -> MigrationResult<()> {
        let current = *self;
        match self {
            InventoryPosition::Range { lower, upper, last } => {
                let below_range = key < *lower;
                let above_range = upper.is_some_and(|upper| key >= upper);
                let backwards = last.is_some_and(|last| key <= last);
                if below_range || above_range || backwards {
                    bail!(
                        ErrorKind::InvalidPosition,
                        "Inventory position cannot move to the given key",
                        format!("key {key} for position {current}")
                    );
                }
                *last = Some(key);
                Ok(())
            }
            InventoryPosition::Unsplit => Ok(()),
            InventoryPosition::Finished => bail!(
                ErrorKind::InvalidPosition,
                "Inventory position is already finished"
            ),
        }
    }
}

impl fmt::Display for InventoryPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InventoryPosition::Range { lower, upper, last } => {
                write!(f, "[{lower}, ")?;
                match upper {
                    Some(upper) => write!(f, "{upper})")?,
                    None => f.write_str("+inf)")?,
                }
                if let Some(last) = last {
                    write!(f, " at {last}")?;
                }
                Ok(())
            }
            InventoryPosition::Unsplit => f.write_str("unsplit"),
            InventoryPosition::Finished => f.write_str("finished"),
        }
    }
}
