use serde::Deserialize;

use crate::shared::{PgConnectionConfig, ValidationError};

/// Descriptor of a source or target storage unit.
///
/// The variant selects the dialect used to read from or write to the data source.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DataSourceConfig {
    /// A Postgres database reached over sqlx.
    Postgres(PgConnectionConfig),
    /// A named in-process database, used for tests and local dry runs.
    Memory { name: String },
}

impl DataSourceConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            DataSourceConfig::Postgres(config) => config.validate(),
            DataSourceConfig::Memory { name } if name.is_empty() => {
                Err(ValidationError::ZeroValue("memory data source name length"))
            }
            DataSourceConfig::Memory { .. } => Ok(()),
        }
    }

    pub fn dialect_name(&self) -> &'static str {
        match self {
            DataSourceConfig::Postgres(_) => "postgres",
            DataSourceConfig::Memory { .. } => "memory",
        }
    }
}
