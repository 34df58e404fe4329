//! Capability interfaces of source and target databases and their implementations.

mod base;
pub mod memory;
pub mod postgres;

pub use base::*;
