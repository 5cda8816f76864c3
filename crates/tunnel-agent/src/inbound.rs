//! The agent never receives stream-opening frames from the server — every
//! `http_request`/`connect_open`/`ws_open` in this system originates on the
//! agent side. This is a no-op implementation of the seam
//! [`tunnel_mux::InboundHandler`] requires, kept only so one multiplexer
//! instance serves both endpoints.

use async_trait::async_trait;
use tracing::warn;
use tunnel_mux::{FrameSender, InboundHandler, StreamReceiver};
use tunnel_protocol::Frame;

pub struct AgentInbound;

#[async_trait]
impl InboundHandler for AgentInbound {
    async fn handle_new_stream(
        &self,
        opening_frame: Frame,
        _stream_rx: StreamReceiver,
        _reply_tx: FrameSender,
    ) {
        warn!(
            stream = %opening_frame.stream_id(),
            frame_type = opening_frame.type_name(),
            "server attempted to open a stream toward the agent, ignoring"
        );
    }
}
