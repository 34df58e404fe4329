//! Metric names emitted by migration jobs.
//!
//! Only the `metrics` facade is used here. Installing an exporter is up to the binary.

/// Label for the job id.
pub const JOB_ID_LABEL: &str = "job_id";

/// Label for the sharding item.
pub const ITEM_LABEL: &str = "item";

/// Label for the target table name.
pub const TABLE_NAME_LABEL: &str = "table_name";

/// Label for the error kind.
pub const ERROR_KIND_LABEL: &str = "error_kind";

/// Counter of rows copied by inventory tasks.
pub const MIGRATION_INVENTORY_RECORDS_TOTAL: &str = "migration_inventory_records_total";

/// Counter of change events applied by incremental tasks.
pub const MIGRATION_INCREMENTAL_RECORDS_TOTAL: &str = "migration_incremental_records_total";

/// Counter of retried batches and re-prepared items.
pub const MIGRATION_TASK_RETRIES_TOTAL: &str = "migration_task_retries_total";

/// Gauge of job items running in this process.
pub const MIGRATION_JOB_ITEMS_RUNNING: &str = "migration_job_items_running";
