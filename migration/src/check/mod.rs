//! Comparison of source and target tables after a migration converged.

mod checker;
mod result;

pub use checker::*;
pub use result::*;
