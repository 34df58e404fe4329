//! Fixtures shared by unit tests and the integration test targets.

pub mod job;
pub mod notify;
pub mod notifying_registry;
pub mod table;
