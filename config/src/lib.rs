//! Configuration types and loading for the migration workspace.
//!
//! Job documents, process tuning, data source descriptors and the coordination backend all
//! live here so that the engine and the worker binary share a single definition.

mod environment;
mod load;
pub mod shared;

pub use environment::*;
pub use load::*;
