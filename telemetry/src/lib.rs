//! Tracing setup shared by the migration worker binary and the test suites.

pub mod tracing;

pub use self::tracing::{init_test_tracing, init_tracing};
