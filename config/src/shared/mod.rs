mod base;
mod connection;
mod coordination;
mod data_source;
mod job;
mod migrator;
mod process;

pub use base::*;
pub use connection::*;
pub use coordination::*;
pub use data_source::*;
pub use job::*;
pub use migrator::*;
pub use process::*;
