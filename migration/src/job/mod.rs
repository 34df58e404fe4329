//! Execution of migration jobs in a worker process.

mod api;
mod context;
mod info;
mod item;
mod persister;
mod pipeline;

pub use api::*;
pub use context::*;
pub use info::*;
pub use item::*;
pub use persister::*;
pub use pipeline::*;
