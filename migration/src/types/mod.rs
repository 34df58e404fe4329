//! Row, schema and change types shared by dumpers, importers and the CDC contract.

mod record;
mod schema;
mod value;

pub use record::*;
pub use schema::*;
pub use value::*;
