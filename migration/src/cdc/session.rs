use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::cdc::importer::{CdcAck, CdcStream};
use crate::cdc::protocol::{
    CdcRequest, CdcResponse, LoginResult, ServerGreetingResult, StreamDataResult, cdc_request,
    cdc_response,
};

/// Version of the message contract announced in the greeting.
pub const PROTOCOL_VERSION: &str = "1";

/// Credentials a consumer must present before streaming.
#[derive(Debug, Clone)]
pub struct CdcCredentials {
    pub username: String,
    /// Hex digest produced by [`crate::cdc::password_digest`].
    pub password_digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitingLogin,
    LoggedIn,
    Streaming,
    Stopped,
}

/// Server side of one consumer connection: login, then stream batches and collect their
/// acknowledgements.
///
/// The session is transport agnostic. Requests and responses are passed in and out as
/// messages, framed by [`crate::cdc::codec`] when sent over a byte stream.
#[derive(Debug)]
pub struct CdcSession {
    credentials: CdcCredentials,
    stream: CdcStream,
    state: SessionState,
    streaming_id: String,
    tables: Vec<String>,
    pending: HashMap<String, CdcAck>,
}

impl CdcSession {
    pub fn new(credentials: CdcCredentials, stream: CdcStream, streaming_id: String) -> Self {
        Self {
            credentials,
            stream,
            state: SessionState::AwaitingLogin,
            streaming_id,
            tables: Vec::new(),
            pending: HashMap::new(),
        }
    }

    /// First message sent to a new consumer.
    pub fn greeting(&self) -> CdcResponse {
        CdcResponse::succeed(
            "",
            cdc_response::Body::ServerGreeting(ServerGreetingResult {
                server_version: env!("CARGO_PKG_VERSION").to_string(),
                protocol_version: PROTOCOL_VERSION.to_string(),
            }),
        )
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }

    pub fn handle(&mut self, request: CdcRequest) -> CdcResponse {
        let request_id = request.request_id;
        let Some(body) = request.body else {
            return CdcResponse::failed(request_id, "request has no body");
        };

        match (self.state, body) {
            (SessionState::AwaitingLogin, cdc_request::Body::Login(login)) => {
                if login.username != self.credentials.username
                    || !digests_match(&login.password_digest, &self.credentials.password_digest)
                {
                    warn!(username = %login.username, "cdc login rejected");
                    return CdcResponse::failed(request_id, "illegal username or password");
                }

                info!(username = %login.username, "cdc consumer logged in");
                self.state = SessionState::LoggedIn;
                CdcResponse::succeed(request_id, cdc_response::Body::Login(LoginResult {}))
            }
            (SessionState::AwaitingLogin, _) => CdcResponse::failed(request_id, "not logged in"),
            (SessionState::LoggedIn, cdc_request::Body::StreamData(stream_data)) => {
                info!(
                    streaming_id = %self.streaming_id,
                    database = %stream_data.database,
                    tables = ?stream_data.source_schema_tables,
                    full = stream_data.full,
                    "cdc streaming started"
                );
                self.tables = stream_data.source_schema_tables;
                self.state = SessionState::Streaming;
                CdcResponse::succeed(
                    request_id,
                    cdc_response::Body::StreamData(StreamDataResult {
                        streaming_id: self.streaming_id.clone(),
                    }),
                )
            }
            (SessionState::Streaming, cdc_request::Body::AckStreaming(ack)) => {
                match self.pending.remove(&ack.ack_id) {
                    Some(pending) => {
                        debug!(ack_id = %ack.ack_id, "cdc batch acknowledged by consumer");
                        pending.acknowledge();
                        CdcResponse {
                            request_id,
                            ..CdcResponse::default()
                        }
                    }
                    None => CdcResponse::failed(request_id, format!("unknown ack id {}", ack.ack_id)),
                }
            }
            (SessionState::Streaming, cdc_request::Body::StopStreaming(stop)) => {
                if stop.streaming_id != self.streaming_id {
                    return CdcResponse::failed(
                        request_id,
                        format!("unknown streaming id {}", stop.streaming_id),
                    );
                }

                info!(streaming_id = %self.streaming_id, "cdc streaming stopped");
                // Unacknowledged batches are dropped so their writers fail and retry.
                self.pending.clear();
                self.state = SessionState::Stopped;
                CdcResponse {
                    request_id,
                    ..CdcResponse::default()
                }
            }
            (state, _) => {
                CdcResponse::failed(request_id, format!("request not allowed in state {state:?}"))
            }
        }
    }

    /// Waits for the next batch while streaming and returns it as a response.
    ///
    /// Returns `None` when the session is not streaming or the producers are gone.
    pub async fn next_records(&mut self) -> Option<CdcResponse> {
        if !self.is_streaming() {
            return None;
        }

        let batch = self.stream.next().await?;
        let (mut result, ack) = batch.into_parts();
        if !self.tables.is_empty() {
            result.records.retain(|record| {
                record.metadata.as_ref().is_some_and(|metadata| {
                    let qualified = format!("{}.{}", metadata.schema, metadata.table);
                    self.tables
                        .iter()
                        .any(|table| *table == metadata.table || *table == qualified)
                })
            });
        }

        self.pending.insert(result.ack_id.clone(), ack);

        Some(CdcResponse::succeed(
            self.streaming_id.clone(),
            cdc_response::Body::DataRecord(result),
        ))
    }
}

fn digests_match(presented: &str, expected: &str) -> bool {
    match (blake3::Hash::from_hex(presented), blake3::Hash::from_hex(expected)) {
        // Hash equality is constant time.
        (Ok(presented), Ok(expected)) => presented == expected,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::client::{CdcClient, decode_record};
    use crate::cdc::importer::{DEFAULT_ACK_TIMEOUT, cdc_channel};
    use crate::cdc::password_digest;
    use crate::cdc::protocol::ResponseStatus;
    use crate::dialect::Importer;
    use crate::test_utils::table::t_order;
    use crate::types::{Column, DataRecord};

    fn credentials() -> CdcCredentials {
        CdcCredentials {
            username: "root".to_string(),
            password_digest: password_digest("secret"),
        }
    }

    fn status(response: &CdcResponse) -> ResponseStatus {
        response.status()
    }

    #[tokio::test]
    async fn login_is_required_before_streaming() {
        let (_importer, stream) = cdc_channel(1, DEFAULT_ACK_TIMEOUT);
        let mut session = CdcSession::new(credentials(), stream, "s1".to_string());
        let mut client = CdcClient::new();

        let response = session.handle(client.stream_data("ds_0", &[], true));
        assert_eq!(status(&response), ResponseStatus::Failed);

        let response = session.handle(client.login("root", "wrong"));
        assert_eq!(status(&response), ResponseStatus::Failed);
        assert_eq!(response.error_message, "illegal username or password");

        let response = session.handle(client.login("root", "secret"));
        assert_eq!(status(&response), ResponseStatus::Succeed);
    }

    #[tokio::test]
    async fn streamed_batches_are_acknowledged_by_id() {
        let (importer, stream) = cdc_channel(1, DEFAULT_ACK_TIMEOUT);
        let mut session = CdcSession::new(credentials(), stream, "s1".to_string());
        let mut client = CdcClient::new();
        session.handle(client.login("root", "secret"));
        let response = session.handle(client.stream_data("ds_0", &["t_order"], false));
        assert!(matches!(
            response.body,
            Some(cdc_response::Body::StreamData(StreamDataResult { ref streaming_id })) if streaming_id == "s1"
        ));

        let record = DataRecord::insert(t_order(), vec![Column::new("order_id", 1i64, true)]);
        let writer = {
            let record = record.clone();
            tokio::spawn(async move { importer.write(&[record]).await })
        };

        let response = session.next_records().await.unwrap();
        let Some(cdc_response::Body::DataRecord(result)) = response.body else {
            panic!("expected a data record result");
        };
        assert_eq!(decode_record(result.records[0].clone()).unwrap(), record);
        assert!(!writer.is_finished());

        let response = session.handle(client.ack(&result.ack_id));
        assert_eq!(status(&response), ResponseStatus::Succeed);
        writer.await.unwrap().unwrap();

        let response = session.handle(client.ack(&result.ack_id));
        assert_eq!(status(&response), ResponseStatus::Failed);
    }

    #[tokio::test]
    async fn stopping_fails_pending_writes() {
        let (importer, stream) = cdc_channel(1, DEFAULT_ACK_TIMEOUT);
        let mut session = CdcSession::new(credentials(), stream, "s1".to_string());
        let mut client = CdcClient::new();
        session.handle(client.login("root", "secret"));
        session.handle(client.stream_data("ds_0", &[], true));

        let writer = tokio::spawn(async move {
            importer
                .write(&[DataRecord::insert(
                    t_order(),
                    vec![Column::new("order_id", 1i64, true)],
                )])
                .await
        });
        session.next_records().await.unwrap();

        let response = session.handle(client.stop_streaming("s1"));
        assert_eq!(status(&response), ResponseStatus::Succeed);
        assert!(!session.is_streaming());
        assert!(writer.await.unwrap().is_err());
    }
}
