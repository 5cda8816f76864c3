//! Dispatch table for frames that open a new stream (§4.5): `http_request`
//! goes to the one-shot dispatcher, `connect_open`/`ws_open` to their
//! respective dial-and-pump handlers. Deregisters the stream from the
//! shared table once its handler returns, since [`tunnel_mux::spawn`] never
//! does so itself for streams it didn't originate.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use tunnel_mux::{FrameSender, InboundHandler, StreamReceiver, StreamTable};
use tunnel_protocol::Frame;

use crate::state::ServerState;
use crate::{dispatcher, tcp_dial, ws_dial};

pub struct ServerInbound {
    state: Arc<ServerState>,
    table: Arc<StreamTable>,
}

impl ServerInbound {
    pub fn new(state: Arc<ServerState>, table: Arc<StreamTable>) -> Self {
        Self { state, table }
    }
}

#[async_trait]
impl InboundHandler for ServerInbound {
    async fn handle_new_stream(
        &self,
        opening_frame: Frame,
        stream_rx: StreamReceiver,
        reply_tx: FrameSender,
    ) {
        let id = opening_frame.stream_id();

        match opening_frame {
            Frame::HttpRequest(payload) => {
                dispatcher::handle(Arc::clone(&self.state), payload, reply_tx).await;
            }
            Frame::ConnectOpen(payload) => {
                tcp_dial::handle(Arc::clone(&self.state), payload, stream_rx, reply_tx).await;
            }
            Frame::WsOpen(payload) => {
                ws_dial::handle(Arc::clone(&self.state), payload, stream_rx, reply_tx).await;
            }
            other => {
                warn!(stream = %id, frame_type = other.type_name(), "unexpected opening frame type");
            }
        }

        self.table.deregister(&id);
    }
}
