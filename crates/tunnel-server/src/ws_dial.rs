//! WebSocket tunnel path (§4.5/§4.6): mirrors [`crate::tcp_dial`] but dials
//! the target over a real WebSocket handshake instead of a bare TCP
//! connect, forwarding the agent's original headers verbatim.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::handshake::client::{generate_key, Request};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use tunnel_mux::{FrameSender, StreamReceiver};
use tunnel_protocol::{Frame, StreamId, WsAckPayload, WsClosePayload, WsMessagePayload, WsMessageType, WsOpenPayload};

use crate::state::ServerState;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn handle(
    state: Arc<ServerState>,
    open: WsOpenPayload,
    stream_rx: StreamReceiver,
    reply_tx: FrameSender,
) {
    state.touch_activity();
    let id = open.id;

    let mut builder = Request::builder().uri(&open.url).header("Sec-WebSocket-Key", generate_key());
    for (name, values) in &open.headers {
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    let request = match builder.body(()) {
        Ok(r) => r,
        Err(e) => {
            warn!(stream = %id, error = %e, "ws_open produced an invalid request");
            send_close(&reply_tx, id, Some(e.to_string())).await;
            return;
        }
    };

    let dial = tokio_tungstenite::connect_async(request);
    let ws = match tokio::time::timeout(DIAL_TIMEOUT, dial).await {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => {
            warn!(stream = %id, url = %open.url, error = %e, "ws_open dial failed");
            send_close(&reply_tx, id, Some(e.to_string())).await;
            return;
        }
        Err(_) => {
            warn!(stream = %id, url = %open.url, "ws_open dial timed out");
            send_close(&reply_tx, id, Some("connection timeout".to_string())).await;
            return;
        }
    };

    debug!(stream = %id, url = %open.url, "ws_open dial succeeded");
    let _ = reply_tx.send(Frame::WsAck(WsAckPayload { id, ok: true, error: None })).await;

    let (mut sink, mut source) = ws.split();
    let mut stream_rx = stream_rx;

    loop {
        tokio::select! {
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.touch_activity();
                        let frame = Frame::WsMessage(WsMessagePayload { id, message_type: WsMessageType::Text, data: text.into_bytes() });
                        if reply_tx.send(frame).await.is_err() { break; }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        state.touch_activity();
                        let frame = Frame::WsMessage(WsMessagePayload { id, message_type: WsMessageType::Binary, data: data.into() });
                        if reply_tx.send(frame).await.is_err() { break; }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let frame = Frame::WsMessage(WsMessagePayload { id, message_type: WsMessageType::Ping, data: data.into() });
                        if reply_tx.send(frame).await.is_err() { break; }
                    }
                    Some(Ok(Message::Pong(data))) => {
                        let frame = Frame::WsMessage(WsMessagePayload { id, message_type: WsMessageType::Pong, data: data.into() });
                        if reply_tx.send(frame).await.is_err() { break; }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1000);
                        let _ = reply_tx.send(Frame::WsClose(WsClosePayload { id, code, error: None })).await;
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        debug!(stream = %id, error = %e, "target websocket read error");
                        send_close(&reply_tx, id, Some(e.to_string())).await;
                        break;
                    }
                    None => {
                        send_close(&reply_tx, id, None).await;
                        break;
                    }
                }
            }
            frame = stream_rx.recv() => {
                match frame {
                    Some(Frame::WsMessage(payload)) => {
                        state.touch_activity();
                        let msg = match payload.message_type {
                            WsMessageType::Text => Message::Text(String::from_utf8_lossy(&payload.data).into_owned().into()),
                            WsMessageType::Binary => Message::Binary(payload.data.into()),
                            WsMessageType::Ping => Message::Ping(payload.data.into()),
                            WsMessageType::Pong => Message::Pong(payload.data.into()),
                            WsMessageType::Close => Message::Close(None),
                        };
                        if sink.send(msg).await.is_err() { break; }
                    }
                    Some(Frame::WsClose(payload)) => {
                        let close = CloseFrame {
                            code: payload.code.into(),
                            reason: payload.error.unwrap_or_default().into(),
                        };
                        let _ = sink.send(Message::Close(Some(close))).await;
                        break;
                    }
                    Some(other) => {
                        warn!(stream = %id, frame_type = other.type_name(), "unexpected frame on websocket stream");
                    }
                    None => break,
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn send_close(reply_tx: &FrameSender, id: StreamId, error: Option<String>) {
    let _ = reply_tx.send(Frame::WsClose(WsClosePayload { id, code: 1011, error })).await;
}
