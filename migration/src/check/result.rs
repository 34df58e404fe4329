use std::fmt;

use serde::{Deserialize, Serialize};

/// First difference found between a source and a target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Mismatch {
    /// Unique key of the differing row. Absent for tables compared by digest only.
    pub key: Option<i64>,
    pub reason: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key {
            Some(key) => write!(f, "key {key}: {}", self.reason),
            None => f.write_str(&self.reason),
        }
    }
}

/// Outcome of checking one table. A mismatch is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConsistencyCheckResult {
    pub table: String,
    pub matched: bool,
    pub source_records: u64,
    pub target_records: u64,
    pub first_mismatch: Option<Mismatch>,
    /// The table was not compared.
    #[serde(default)]
    pub ignored: bool,
}

impl ConsistencyCheckResult {
    pub fn ignored(table: String) -> Self {
        Self {
            table,
            matched: false,
            source_records: 0,
            target_records: 0,
            first_mismatch: None,
            ignored: true,
        }
    }
}

/// Whether a set of per-table results lets the job be committed.
///
/// Passes only if there is at least one result and every table matched or was ignored.
pub fn aggregate_check_results(results: &[ConsistencyCheckResult]) -> bool {
    !results.is_empty() && results.iter().all(|result| result.matched || result.ignored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(matched: bool, ignored: bool) -> ConsistencyCheckResult {
        ConsistencyCheckResult {
            table: "t_order".to_string(),
            matched,
            source_records: 1,
            target_records: 1,
            first_mismatch: None,
            ignored,
        }
    }

    #[test]
    fn aggregation_requires_every_table_to_pass() {
        assert!(!aggregate_check_results(&[]));
        assert!(aggregate_check_results(&[result(true, false), result(false, true)]));
        assert!(!aggregate_check_results(&[result(true, false), result(false, false)]));
    }

    #[test]
    fn mismatches_name_the_row() {
        let mismatch = Mismatch {
            key: Some(3),
            reason: "row missing from target".to_string(),
        };

        insta::assert_snapshot!(mismatch, @"key 3: row missing from target");
    }
}
