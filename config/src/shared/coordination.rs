use serde::Deserialize;

use crate::shared::{PgConnectionConfig, ValidationError};

/// Backend holding progress, barriers and locks shared between worker processes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CoordinationConfig {
    /// Process-local registry. Only valid when a single worker runs every sharding item.
    #[default]
    Memory,
    /// Registry table and advisory locks in a Postgres database.
    Postgres(PgConnectionConfig),
}

impl CoordinationConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            CoordinationConfig::Memory => Ok(()),
            CoordinationConfig::Postgres(config) => config.validate(),
        }
    }
}
