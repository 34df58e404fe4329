//! State shared between worker processes: the registry tree, progress persistence, barriers and
//! job-scoped locks.

mod barrier;
pub mod keys;
mod lock;
mod memory;
mod postgres;
mod registry;
mod repository;

pub use barrier::*;
pub use lock::*;
pub use memory::*;
pub use postgres::*;
pub use registry::*;
pub use repository::*;
