use bytes::{Buf, BytesMut};
use prost::Message;

use crate::bail;
use crate::error::{ErrorKind, MigrationResult};
use crate::migration_error;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Longest encoding of a varint length prefix.
const MAX_LENGTH_DELIMITER_LEN: usize = 10;

/// Appends `message` to `buf`, prefixed with its varint encoded length.
pub fn encode_frame<M: Message>(message: &M, buf: &mut BytesMut) -> MigrationResult<()> {
    let len = message.encoded_len();
    if len > MAX_FRAME_LEN {
        bail!(
            ErrorKind::ProtocolError,
            "CDC frame is too large",
            format!("{len} bytes, at most {MAX_FRAME_LEN}")
        );
    }

    buf.reserve(len + MAX_LENGTH_DELIMITER_LEN);
    message
        .encode_length_delimited(buf)
        .map_err(|err| migration_error!(ErrorKind::ProtocolError, "CDC frame encoding failed", err))
}

/// Takes one complete frame from the front of `buf`.
///
/// Returns `None` while the frame is incomplete and leaves `buf` untouched in that case.
pub fn decode_frame<M: Message + Default>(buf: &mut BytesMut) -> MigrationResult<Option<M>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let len = match prost::decode_length_delimiter(&buf[..]) {
        Ok(len) => len,
        Err(_) if buf.len() < MAX_LENGTH_DELIMITER_LEN => return Ok(None),
        Err(err) => bail!(
            ErrorKind::ProtocolError,
            "CDC frame has an invalid length prefix",
            source: err
        ),
    };
    if len > MAX_FRAME_LEN {
        bail!(
            ErrorKind::ProtocolError,
            "CDC frame is too large",
            format!("{len} bytes, at most {MAX_FRAME_LEN}")
        );
    }

    let header_len = prost::length_delimiter_len(len);
    if buf.len() < header_len + len {
        return Ok(None);
    }

    buf.advance(header_len);
    let frame = buf.split_to(len).freeze();

    Ok(Some(M::decode(frame)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::protocol::{AckStreamingRequest, CdcRequest, cdc_request};

    fn ack(ack_id: &str) -> CdcRequest {
        CdcRequest {
            request_id: "r1".to_string(),
            body: Some(cdc_request::Body::AckStreaming(AckStreamingRequest {
                ack_id: ack_id.to_string(),
            })),
        }
    }

    #[test]
    fn frames_are_split_at_their_boundaries() {
        let mut buf = BytesMut::new();
        encode_frame(&ack("1"), &mut buf).unwrap();
        encode_frame(&ack("2"), &mut buf).unwrap();

        assert_eq!(decode_frame::<CdcRequest>(&mut buf).unwrap(), Some(ack("1")));
        assert_eq!(decode_frame::<CdcRequest>(&mut buf).unwrap(), Some(ack("2")));
        assert_eq!(decode_frame::<CdcRequest>(&mut buf).unwrap(), None);
    }

    #[test]
    fn incomplete_frames_wait_for_more_bytes() {
        let mut encoded = BytesMut::new();
        encode_frame(&ack("42"), &mut encoded).unwrap();

        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert_eq!(decode_frame::<CdcRequest>(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), encoded.len() - 1);

        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        assert_eq!(decode_frame::<CdcRequest>(&mut buf).unwrap(), Some(ack("42")));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut buf = BytesMut::new();
        prost::encode_length_delimiter(MAX_FRAME_LEN + 1, &mut buf).unwrap();

        let err = decode_frame::<CdcRequest>(&mut buf).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }
}
