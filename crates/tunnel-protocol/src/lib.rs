//! Wire types and codec for the agent↔server tunnel transport.
//!
//! This crate has no knowledge of TLS, multiplexing, or dispatch — it only
//! defines what a frame looks like on the wire and how to encode/decode one.

mod codec;
mod frame;
mod stream_id;

pub use codec::{DecodedFrame, FrameCodec, ProtocolError, MAX_FRAME_LEN};
pub use frame::{
    ConnectAckPayload, ConnectClosePayload, ConnectDataPayload, ConnectOpenPayload, Frame,
    HttpRequestPayload, HttpResponsePayload, WsAckPayload, WsClosePayload, WsMessagePayload,
    WsMessageType, WsOpenPayload,
};
pub use stream_id::StreamId;
