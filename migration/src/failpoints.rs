use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, MigrationResult};

pub const PREPARE__BEFORE_CREATE_TABLES: &str = "prepare.before_create_tables";
pub const PREPARE__BEFORE_INIT_POSITION: &str = "prepare.before_init_position";
pub const INVENTORY__BEFORE_WRITE_BATCH: &str = "inventory.before_write_batch";

/// Returns an error when the named fail point is configured to fire.
///
/// The fail point parameter selects the error kind: `retry` or `no_retry` (the default).
pub fn migration_fail_point(name: &str) -> MigrationResult<()> {
    fail_point!(name, |parameter| {
        let error_kind = match parameter.as_deref() {
            Some("retry") => ErrorKind::WithRetry,
            _ => ErrorKind::WithNoRetry,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
