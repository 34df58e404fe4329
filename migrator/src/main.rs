//! Migration worker binary.
//!
//! Loads the worker configuration, makes sure the configured job exists and runs the sharding
//! items assigned to this process until they finish or a shutdown signal arrives.

use telemetry::tracing::init_tracing;

use crate::config::load_migrator_config;
use crate::core::start_migrator;

mod config;
mod core;

fn main() -> anyhow::Result<()> {
    let migrator_config = load_migrator_config()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_migrator(migrator_config))?;

    Ok(())
}
