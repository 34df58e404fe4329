use serde::{Deserialize, Serialize};

use crate::shared::{ProcessConfig, ValidationError};

/// Persisted description of a migration job.
///
/// Data sources are referenced by name and resolved by each worker from its own
/// configuration, so the document never contains credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JobConfig {
    /// Explicit job id. Generated from the job descriptor when absent.
    #[serde(default)]
    pub job_id: Option<String>,
    pub source: String,
    pub target: String,
    pub tables: Vec<TableMapping>,
    pub sharding_total_count: u32,
    /// Whether existing rows are copied. When `false` only changes are streamed.
    #[serde(default = "default_full")]
    pub full: bool,
    #[serde(default)]
    pub process: ProcessConfig,
}

fn default_full() -> bool {
    true
}

impl JobConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tables.is_empty() {
            return Err(ValidationError::NoTables);
        }
        if self.sharding_total_count == 0 {
            return Err(ValidationError::ShardingTotalCountZero);
        }
        if self.sharding_total_count as usize > self.tables.len() {
            return Err(ValidationError::ShardingTotalCountExceedsTables {
                count: self.sharding_total_count,
                tables: self.tables.len(),
            });
        }
        for table in &self.tables {
            table.validate()?;
        }

        self.process.validate()
    }

    /// Returns the tables handled by `item`.
    ///
    /// Tables are assigned round-robin so the assignment is stable across restarts.
    pub fn tables_for_item(&self, item: u32) -> Vec<&TableMapping> {
        let count = self.sharding_total_count.max(1) as usize;
        self.tables
            .iter()
            .enumerate()
            .filter(|(index, _)| index % count == item as usize)
            .map(|(_, table)| table)
            .collect()
    }
}

/// Maps one source table onto one target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TableMapping {
    pub source_table: String,
    pub target_table: String,
    /// Column used to split and page the inventory copy. Falls back to the primary key.
    #[serde(default)]
    pub unique_key: Option<String>,
}

impl TableMapping {
    pub fn new(source_table: impl Into<String>, target_table: impl Into<String>) -> Self {
        Self {
            source_table: source_table.into(),
            target_table: target_table.into(),
            unique_key: None,
        }
    }

    pub fn with_unique_key(mut self, unique_key: impl Into<String>) -> Self {
        self.unique_key = Some(unique_key.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source_table.is_empty() || self.target_table.is_empty() {
            return Err(ValidationError::EmptyTableName);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(tables: usize, sharding_total_count: u32) -> JobConfig {
        JobConfig {
            job_id: None,
            source: "ds_0".to_string(),
            target: "ds_1".to_string(),
            tables: (0..tables)
                .map(|i| TableMapping::new(format!("t_{i}"), format!("t_{i}")))
                .collect(),
            sharding_total_count,
            full: true,
            process: ProcessConfig::default(),
        }
    }

    #[test]
    fn zero_sharding_items_are_rejected() {
        assert_eq!(
            job(2, 0).validate(),
            Err(ValidationError::ShardingTotalCountZero)
        );
    }

    #[test]
    fn more_sharding_items_than_tables_are_rejected() {
        assert_eq!(
            job(2, 3).validate(),
            Err(ValidationError::ShardingTotalCountExceedsTables {
                count: 3,
                tables: 2
            })
        );
    }

    #[test]
    fn tables_are_assigned_round_robin() {
        let config = job(5, 2);

        let item_0: Vec<_> = config
            .tables_for_item(0)
            .into_iter()
            .map(|t| t.source_table.as_str())
            .collect();
        let item_1: Vec<_> = config
            .tables_for_item(1)
            .into_iter()
            .map(|t| t.source_table.as_str())
            .collect();

        assert_eq!(item_0, vec!["t_0", "t_2", "t_4"]);
        assert_eq!(item_1, vec!["t_1", "t_3"]);
    }

    #[test]
    fn missing_process_section_uses_defaults() {
        let config: JobConfig = serde_json::from_str(
            r#"{"source":"a","target":"b","tables":[{"source_table":"t","target_table":"t"}],"sharding_total_count":1}"#,
        )
        .unwrap();

        assert!(config.full);
        assert_eq!(config.process, ProcessConfig::default());
        assert!(config.validate().is_ok());
    }
}
