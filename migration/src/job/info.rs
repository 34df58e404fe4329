use chrono::{DateTime, Utc};
use config::shared::JobConfig;
use serde::{Deserialize, Serialize};

/// Prefix of generated job ids.
const JOB_ID_PREFIX: &str = "j01";

/// Number of hex characters taken from the descriptor hash.
const JOB_ID_HASH_LEN: usize = 30;

/// Registry document describing a job and whether it should be running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JobInfo {
    pub job_id: String,
    pub active: bool,
    pub sharding_total_count: u32,
    /// `source_table:target_table` pairs.
    pub tables: Vec<String>,
    pub create_time: DateTime<Utc>,
    pub stop_time: Option<DateTime<Utc>>,
}

impl JobInfo {
    pub fn new(job_id: String, config: &JobConfig) -> Self {
        Self {
            job_id,
            active: false,
            sharding_total_count: config.sharding_total_count,
            tables: config
                .tables
                .iter()
                .map(|table| format!("{}:{}", table.source_table, table.target_table))
                .collect(),
            create_time: Utc::now(),
            stop_time: None,
        }
    }
}

/// Derives a job id from the source, target and tables of `config`.
///
/// The same descriptor always yields the same id, so creating a job twice is detected as a
/// duplicate.
pub fn generate_job_id(config: &JobConfig) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(config.source.as_bytes());
    hasher.update(b"|");
    hasher.update(config.target.as_bytes());
    for table in &config.tables {
        hasher.update(b"|");
        hasher.update(table.source_table.as_bytes());
        hasher.update(b":");
        hasher.update(table.target_table.as_bytes());
    }

    let hash = hasher.finalize().to_hex();
    format!("{JOB_ID_PREFIX}{}", &hash.as_str()[..JOB_ID_HASH_LEN])
}
