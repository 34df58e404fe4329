//! Online data migration between databases.
//!
//! A job copies the existing rows of its tables (inventory) and then tails the source change
//! stream (incremental) until the target converges, after which a consistency check compares
//! both sides. Jobs are split into sharding items that run in any number of worker processes,
//! coordinated through a shared registry and a lock service.

pub mod cdc;
pub mod check;
pub mod concurrency;
pub mod coordination;
pub mod dialect;
pub mod error;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod job;
mod macros;
pub mod metrics;
pub mod policy;
pub mod position;
pub mod preparer;
pub mod progress;
pub mod rate_limit;
pub mod splitter;
pub mod task;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
