//! Length-prefixed JSON framing for [`Frame`] envelopes.
//!
//! Wire shape: a 4-byte big-endian length prefix followed by that many bytes
//! of a single JSON value. A complete envelope is either fully delivered to
//! the caller or an error is returned — partial reads are never observable
//! (§4.1).

use bytes::{Buf, BufMut, BytesMut};
use serde::Deserialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::Frame;

/// Frames larger than this are rejected outright; a corrupt length prefix
/// must not be able to make the mux layer allocate unbounded memory.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX_SIZE: usize = 4;

/// Every `type` tag [`Frame`] knows how to decode. Kept separate from the
/// enum itself so checking membership doesn't require a full decode attempt.
const KNOWN_FRAME_TYPES: &[&str] = &[
    "http_request",
    "http_response",
    "connect_open",
    "connect_ack",
    "connect_data",
    "connect_close",
    "ws_open",
    "ws_ack",
    "ws_message",
    "ws_close",
];

#[derive(Deserialize)]
struct EnvelopeTag<'a> {
    #[serde(rename = "type")]
    type_name: &'a str,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
    #[error("malformed envelope JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What [`FrameCodec::decode`] produces for one length-delimited envelope:
/// either a frame this crate knows how to handle, or the bare `type` tag of
/// one it doesn't (§4.1: "Unknown envelope types are logged and dropped" —
/// forward compatibility with a newer peer, distinct from a genuinely
/// corrupt or truncated envelope, which is still a decode error).
#[derive(Debug)]
pub enum DecodedFrame {
    Known(Frame),
    Unknown(String),
}

/// A [`tokio_util::codec::Decoder`]/[`Encoder`] pair for [`Frame`] values.
///
/// One `FrameCodec` is typically wrapped in a `tokio_util::codec::Framed`
/// around the raw TLS stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = DecodedFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DecodedFrame>, ProtocolError> {
        if src.len() < LEN_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes(src[..LEN_PREFIX_SIZE].try_into().unwrap()) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(len));
        }

        if src.len() < LEN_PREFIX_SIZE + len {
            // Not enough data yet; reserve room so the next read can fill it
            // in one shot rather than growing the buffer repeatedly.
            src.reserve(LEN_PREFIX_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX_SIZE);
        let payload = src.split_to(len);

        if let Ok(tag) = serde_json::from_slice::<EnvelopeTag>(&payload) {
            if !KNOWN_FRAME_TYPES.contains(&tag.type_name) {
                return Ok(Some(DecodedFrame::Unknown(tag.type_name.to_string())));
            }
        }

        let frame: Frame = serde_json::from_slice(&payload)?;
        Ok(Some(DecodedFrame::Known(frame)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(payload.len()));
        }
        dst.reserve(LEN_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ConnectOpenPayload, Frame};
    use crate::stream_id::StreamId;
    use tokio_util::codec::{FramedRead, FramedWrite};
    use futures_util::{SinkExt, StreamExt};

    fn sample_frame() -> Frame {
        Frame::ConnectOpen(ConnectOpenPayload {
            id: StreamId::new(),
            address: "example.com:443".into(),
        })
    }

    #[tokio::test]
    async fn round_trips_a_single_frame_over_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FramedWrite::new(client, FrameCodec);
        let mut reader = FramedRead::new(server, FrameCodec);

        let frame = sample_frame();
        writer.send(frame.clone()).await.unwrap();
        let received = match reader.next().await.unwrap().unwrap() {
            DecodedFrame::Known(f) => f,
            DecodedFrame::Unknown(name) => panic!("unexpected unknown frame: {name}"),
        };
        assert_eq!(received.stream_id(), frame.stream_id());
    }

    #[tokio::test]
    async fn a_truncated_prefix_waits_for_more_bytes_rather_than_erroring() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u8(0);
        let mut codec = FrameCodec;
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn an_oversized_length_prefix_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        let mut codec = FrameCodec;
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn an_unrecognized_type_tag_decodes_as_unknown_instead_of_erroring() {
        let json = br#"{"type":"frobnicate","payload":{}}"#;
        let mut buf = BytesMut::new();
        buf.put_u32(json.len() as u32);
        buf.put_slice(json);
        let mut codec = FrameCodec;
        match codec.decode(&mut buf).unwrap() {
            Some(DecodedFrame::Unknown(name)) => assert_eq!(name, "frobnicate"),
            other => panic!("expected DecodedFrame::Unknown, got {other:?}"),
        }
    }

    #[test]
    fn a_known_type_tag_with_a_malformed_payload_still_errors() {
        let json = br#"{"type":"connect_open","payload":{}}"#;
        let mut buf = BytesMut::new();
        buf.put_u32(json.len() as u32);
        buf.put_slice(json);
        let mut codec = FrameCodec;
        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::InvalidJson(_))));
    }

    #[tokio::test]
    async fn multiple_frames_written_back_to_back_are_each_delivered_once() {
        let (client, server) = tokio::io::duplex(8192);
        let mut writer = FramedWrite::new(client, FrameCodec);
        let mut reader = FramedRead::new(server, FrameCodec);

        let a = sample_frame();
        let b = sample_frame();
        writer.send(a.clone()).await.unwrap();
        writer.send(b.clone()).await.unwrap();

        let first = match reader.next().await.unwrap().unwrap() {
            DecodedFrame::Known(f) => f,
            DecodedFrame::Unknown(name) => panic!("unexpected unknown frame: {name}"),
        };
        let second = match reader.next().await.unwrap().unwrap() {
            DecodedFrame::Known(f) => f,
            DecodedFrame::Unknown(name) => panic!("unexpected unknown frame: {name}"),
        };
        assert_eq!(first.stream_id(), a.stream_id());
        assert_eq!(second.stream_id(), b.stream_id());
    }
}
