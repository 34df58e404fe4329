//! Inventory and incremental tasks and the configuration they are built from.

pub mod config;
pub mod incremental;
pub mod inventory;
pub(crate) mod retry;

pub use config::*;
pub use incremental::{IncrementalTask, IncrementalTaskState};
pub use inventory::{InventoryTask, InventoryTaskResult};
