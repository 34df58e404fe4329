//! Messages exchanged between a CDC consumer and the worker producing its change stream.
//!
//! The messages are plain prost types, so any protobuf implementation can speak the same
//! contract. Values are self-describing and carry no reference to a schema registry.

/// Kind of change carried by a [`Record`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum DataChangeType {
    Unknown = 0,
    Insert = 1,
    Update = 2,
    Delete = 3,
}

/// Outcome reported by every [`CdcResponse`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ResponseStatus {
    Succeed = 0,
    Failed = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LoginRequest {
    #[prost(string, tag = "1")]
    pub username: String,
    /// Hex digest of the password. The clear password never travels.
    #[prost(string, tag = "2")]
    pub password_digest: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StreamDataRequest {
    #[prost(string, tag = "1")]
    pub database: String,
    /// `schema.table` or bare table names. Empty means every table of the job.
    #[prost(string, repeated, tag = "2")]
    pub source_schema_tables: Vec<String>,
    /// Whether existing rows are streamed before changes.
    #[prost(bool, tag = "3")]
    pub full: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AckStreamingRequest {
    #[prost(string, tag = "1")]
    pub ack_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StopStreamingRequest {
    #[prost(string, tag = "1")]
    pub streaming_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CdcRequest {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(oneof = "cdc_request::Body", tags = "2, 3, 4, 5")]
    pub body: Option<cdc_request::Body>,
}

pub mod cdc_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "2")]
        Login(super::LoginRequest),
        #[prost(message, tag = "3")]
        StreamData(super::StreamDataRequest),
        #[prost(message, tag = "4")]
        AckStreaming(super::AckStreamingRequest),
        #[prost(message, tag = "5")]
        StopStreaming(super::StopStreamingRequest),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServerGreetingResult {
    #[prost(string, tag = "1")]
    pub server_version: String,
    #[prost(string, tag = "2")]
    pub protocol_version: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LoginResult {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StreamDataResult {
    #[prost(string, tag = "1")]
    pub streaming_id: String,
}

/// A batch of records. The consumer confirms it with an [`AckStreamingRequest`] naming
/// `ack_id`; the next batch is only produced after that.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DataRecordResult {
    #[prost(message, repeated, tag = "1")]
    pub records: Vec<Record>,
    #[prost(string, tag = "2")]
    pub ack_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CdcResponse {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(enumeration = "ResponseStatus", tag = "2")]
    pub status: i32,
    #[prost(string, tag = "3")]
    pub error_message: String,
    #[prost(oneof = "cdc_response::Body", tags = "4, 5, 6, 7")]
    pub body: Option<cdc_response::Body>,
}

pub mod cdc_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "4")]
        ServerGreeting(super::ServerGreetingResult),
        #[prost(message, tag = "5")]
        Login(super::LoginResult),
        #[prost(message, tag = "6")]
        StreamData(super::StreamDataResult),
        #[prost(message, tag = "7")]
        DataRecord(super::DataRecordResult),
    }
}

impl CdcResponse {
    pub fn succeed(request_id: impl Into<String>, body: cdc_response::Body) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Succeed as i32,
            error_message: String::new(),
            body: Some(body),
        }
    }

    pub fn failed(request_id: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Failed as i32,
            error_message: error_message.into(),
            body: None,
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MetaData {
    #[prost(string, tag = "1")]
    pub schema: String,
    #[prost(string, tag = "2")]
    pub table: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TableColumn {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub value: Option<TypedValue>,
    #[prost(bool, tag = "3")]
    pub key: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Record {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<MetaData>,
    #[prost(enumeration = "DataChangeType", tag = "2")]
    pub data_change_type: i32,
    #[prost(message, repeated, tag = "3")]
    pub before: Vec<TableColumn>,
    #[prost(message, repeated, tag = "4")]
    pub after: Vec<TableColumn>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TypedValue {
    #[prost(oneof = "typed_value::Kind", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13")]
    pub kind: Option<typed_value::Kind>,
}

pub mod typed_value {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(bool, tag = "1")]
        Null(bool),
        #[prost(bool, tag = "2")]
        Bool(bool),
        #[prost(int32, tag = "3")]
        Int32(i32),
        #[prost(int64, tag = "4")]
        Int64(i64),
        #[prost(double, tag = "5")]
        Double(f64),
        #[prost(string, tag = "6")]
        String(String),
        #[prost(bytes = "vec", tag = "7")]
        Bytes(Vec<u8>),
        /// Decimal in its canonical text form.
        #[prost(string, tag = "8")]
        Decimal(String),
        /// Milliseconds since the Unix epoch, UTC.
        #[prost(int64, tag = "9")]
        TimestampMillis(i64),
        /// Milliseconds since the Unix epoch of a timestamp without time zone.
        #[prost(int64, tag = "10")]
        LocalTimestampMillis(i64),
        /// Days since the Unix epoch.
        #[prost(int32, tag = "11")]
        DateDays(i32),
        #[prost(string, tag = "12")]
        Uuid(String),
        #[prost(string, tag = "13")]
        Json(String),
    }
}
