//! WebSocket upgrade path (§4.7): computes the `Sec-WebSocket-Accept` value
//! with the already-present `tokio-tungstenite` dependency's handshake
//! helper (no new `sha1` dependency needed), opens a `ws_open` stream, waits
//! up to 10s for `ws_ack`, then shuttles tungstenite messages over the
//! tunnel's per-stream channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use tunnel_protocol::{Frame, StreamId, WsClosePayload, WsMessagePayload, WsMessageType, WsOpenPayload};

use crate::proxy::{empty_body, full_body, ResponseBody};
use crate::state::AgentState;

const ACK_TIMEOUT: Duration = Duration::from_secs(10);

pub fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_header = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let has_connection_upgrade = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
    has_upgrade_header && has_connection_upgrade
}

pub async fn handle(req: Request<Incoming>, state: Arc<AgentState>) -> Response<ResponseBody> {
    let Some(tunnel) = state.current() else {
        return status_response(StatusCode::SERVICE_UNAVAILABLE, "tunnel not connected");
    };

    let Some(ws_key) = req.headers().get("sec-websocket-key").and_then(|v| v.to_str().ok()) else {
        return status_response(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
    };
    let accept_key = derive_accept_key(ws_key.as_bytes());

    let url = req.uri().to_string();
    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            headers.entry(name.as_str().to_string()).or_default().push(v.to_string());
        }
    }

    let id = StreamId::new();
    let mut stream_rx = tunnel.table.register(id);
    let open = Frame::WsOpen(WsOpenPayload { id, url, headers });
    if tunnel.frame_tx.send(open).await.is_err() {
        tunnel.table.deregister(&id);
        return status_response(StatusCode::SERVICE_UNAVAILABLE, "tunnel not connected");
    }

    match tokio::time::timeout(ACK_TIMEOUT, stream_rx.recv()).await {
        Ok(Some(Frame::WsAck(payload))) if payload.ok => {}
        Ok(Some(Frame::WsAck(payload))) => {
            tunnel.table.deregister(&id);
            let msg = payload.error.unwrap_or_else(|| "websocket upgrade rejected".to_string());
            return status_response(StatusCode::BAD_GATEWAY, &msg);
        }
        Ok(Some(other)) => {
            tunnel.table.deregister(&id);
            warn!(frame_type = other.type_name(), "unexpected frame waiting for ws_ack");
            return status_response(StatusCode::BAD_GATEWAY, "unexpected tunnel frame");
        }
        Ok(None) => {
            tunnel.table.deregister(&id);
            return status_response(StatusCode::BAD_GATEWAY, "tunnel closed before ack");
        }
        Err(_) => {
            tunnel.table.deregister(&id);
            return status_response(StatusCode::GATEWAY_TIMEOUT, "ws_ack timed out");
        }
    }

    let frame_tx = tunnel.frame_tx.clone();
    let table = Arc::clone(&tunnel.table);
    tokio::task::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let io = hyper_util::rt::TokioIo::new(upgraded);
                let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                pump(ws, id, frame_tx.clone(), stream_rx).await;
            }
            Err(e) => {
                warn!(error = %e, "websocket upgrade failed");
                let _ = frame_tx
                    .send(Frame::WsClose(WsClosePayload { id, code: 1011, error: Some(e.to_string()) }))
                    .await;
            }
        }
        table.deregister(&id);
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::UPGRADE, "websocket")
        .header(hyper::header::CONNECTION, "Upgrade")
        .header("Sec-WebSocket-Accept", accept_key)
        .body(empty_body())
        .expect("static 101 response is always valid")
}

async fn pump(
    ws: WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>,
    id: StreamId,
    frame_tx: tunnel_mux::FrameSender,
    mut stream_rx: tunnel_mux::StreamReceiver,
) {
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = Frame::WsMessage(WsMessagePayload { id, message_type: WsMessageType::Text, data: text.into_bytes() });
                        if frame_tx.send(frame).await.is_err() { break; }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let frame = Frame::WsMessage(WsMessagePayload { id, message_type: WsMessageType::Binary, data: data.into() });
                        if frame_tx.send(frame).await.is_err() { break; }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let frame = Frame::WsMessage(WsMessagePayload { id, message_type: WsMessageType::Ping, data: data.into() });
                        if frame_tx.send(frame).await.is_err() { break; }
                    }
                    Some(Ok(Message::Pong(data))) => {
                        let frame = Frame::WsMessage(WsMessagePayload { id, message_type: WsMessageType::Pong, data: data.into() });
                        if frame_tx.send(frame).await.is_err() { break; }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1000);
                        let _ = frame_tx.send(Frame::WsClose(WsClosePayload { id, code, error: None })).await;
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "client websocket read error");
                        let _ = frame_tx.send(Frame::WsClose(WsClosePayload { id, code: 1011, error: Some(e.to_string()) })).await;
                        break;
                    }
                    None => {
                        let _ = frame_tx.send(Frame::WsClose(WsClosePayload { id, code: 1000, error: None })).await;
                        break;
                    }
                }
            }
            frame = stream_rx.recv() => {
                match frame {
                    Some(Frame::WsMessage(payload)) => {
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
                        warn!(frame_type = other.type_name(), "unexpected frame on websocket stream");
                    }
                    None => break,
                }
            }
        }
    }
    let _ = sink.close().await;
}

fn status_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .header("X-Error", message)
        .body(full_body(bytes::Bytes::from(message.to_string())))
        .expect("static status responses are always valid")
}
