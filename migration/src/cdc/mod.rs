//! Message contract for streaming a job's records to an external CDC consumer.
//!
//! [`importer::CdcImporter`] takes the place of a target database: every batch a task writes
//! is handed to the consumer and the write completes once the consumer acknowledges it.
//! [`session::CdcSession`] drives the login and streaming handshake, and [`client`] holds the
//! consumer side conversions back into native records.

pub mod client;
pub mod codec;
pub mod importer;
pub mod protocol;
pub mod session;

pub use importer::{CdcDialect, CdcImporter, CdcStream, cdc_channel};
pub use session::{CdcCredentials, CdcSession};

/// Digest of a password as carried by [`protocol::LoginRequest::password_digest`].
pub fn password_digest(password: &str) -> String {
    blake3::hash(password.as_bytes()).to_hex().to_string()
}
