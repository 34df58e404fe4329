use std::collections::BTreeMap;

use serde::Deserialize;

use crate::load::Config;
use crate::shared::{CoordinationConfig, DataSourceConfig, JobConfig, ValidationError};

/// Top-level configuration of a migration worker process.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MigratorConfig {
    /// Named data sources referenced by [`JobConfig::source`] and [`JobConfig::target`].
    pub data_sources: BTreeMap<String, DataSourceConfig>,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    pub job: JobConfig,
    /// Sharding items this worker runs. All items when empty.
    #[serde(default)]
    pub sharding_items: Vec<u32>,
}

impl MigratorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.job.validate()?;
        self.coordination.validate()?;

        for name in [&self.job.source, &self.job.target] {
            let data_source = self
                .data_sources
                .get(name)
                .ok_or_else(|| ValidationError::UnknownDataSource(name.clone()))?;
            data_source.validate()?;
        }

        for &item in &self.sharding_items {
            if item >= self.job.sharding_total_count {
                return Err(ValidationError::ShardingItemOutOfRange {
                    item,
                    count: self.job.sharding_total_count,
                });
            }
        }

        Ok(())
    }

    /// Returns the sharding items assigned to this worker.
    pub fn assigned_items(&self) -> Vec<u32> {
        if self.sharding_items.is_empty() {
            (0..self.job.sharding_total_count).collect()
        } else {
            self.sharding_items.clone()
        }
    }
}

impl Config for MigratorConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["sharding_items"];
}
