//! Concurrency primitives shared by job items and their tasks.
//!
//! [`shutdown`] carries the `stopping` flag of a job item to every task it runs, and [`stream`]
//! batches change events by size and time while honoring that flag.

pub mod shutdown;
pub mod stream;
