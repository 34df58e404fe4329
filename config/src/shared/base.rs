use thiserror::Error;

/// Reasons a configuration document is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("`sharding_total_count` cannot be zero")]
    ShardingTotalCountZero,
    #[error("`sharding_total_count` ({count}) exceeds the number of tables ({tables})")]
    ShardingTotalCountExceedsTables { count: u32, tables: usize },
    #[error("a job must migrate at least one table")]
    NoTables,
    #[error("table names cannot be empty")]
    EmptyTableName,
    #[error("`{0}` cannot be zero")]
    ZeroValue(&'static str),
    #[error("data source `{0}` is not configured")]
    UnknownDataSource(String),
    #[error("sharding item {item} is out of range for {count} sharding items")]
    ShardingItemOutOfRange { item: u32, count: u32 },
    #[error("invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
}
