//! `CONNECT` tunnel path (§4.7): opens a `connect_open` stream, waits up to
//! 10s for `connect_ack`, then upgrades the client socket and pumps bytes
//! between it and the tunnel's per-stream channel instead of a second TCP
//! socket to the real target.

use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use tunnel_protocol::{ConnectClosePayload, ConnectDataPayload, ConnectOpenPayload, Frame, StreamId};

use crate::proxy::{empty_body, full_body, ResponseBody};
use crate::state::AgentState;

const ACK_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn handle(req: Request<Incoming>, state: Arc<AgentState>) -> Response<ResponseBody> {
    let Some(tunnel) = state.current() else {
        return status_response(StatusCode::SERVICE_UNAVAILABLE, "tunnel not connected");
    };

    let Some(authority) = req.uri().authority().cloned() else {
        return status_response(StatusCode::BAD_REQUEST, "CONNECT missing target authority");
    };
    let address = authority.to_string();

    let id = StreamId::new();
    let mut stream_rx = tunnel.table.register(id);
    let open = Frame::ConnectOpen(ConnectOpenPayload { id, address: address.clone() });
    if tunnel.frame_tx.send(open).await.is_err() {
        tunnel.table.deregister(&id);
        return status_response(StatusCode::SERVICE_UNAVAILABLE, "tunnel not connected");
    }

    let ack = tokio::time::timeout(ACK_TIMEOUT, stream_rx.recv()).await;
    match ack {
        Ok(Some(Frame::ConnectAck(payload))) if payload.ok => {}
        Ok(Some(Frame::ConnectAck(payload))) => {
            tunnel.table.deregister(&id);
            let msg = payload.error.unwrap_or_else(|| "target unreachable".to_string());
            warn!(target = %address, error = %msg, "connect_open rejected by server");
            return status_response(StatusCode::BAD_GATEWAY, &msg);
        }
        Ok(Some(other)) => {
            tunnel.table.deregister(&id);
            warn!(frame_type = other.type_name(), "unexpected frame waiting for connect_ack");
            return status_response(StatusCode::BAD_GATEWAY, "unexpected tunnel frame");
        }
        Ok(None) => {
            tunnel.table.deregister(&id);
            return status_response(StatusCode::BAD_GATEWAY, "tunnel closed before ack");
        }
        Err(_) => {
            tunnel.table.deregister(&id);
            return status_response(StatusCode::GATEWAY_TIMEOUT, "connect_ack timed out");
        }
    }

    debug!(target = %address, stream = %id, "connect tunnel established");

    let frame_tx = tunnel.frame_tx.clone();
    let table = Arc::clone(&tunnel.table);
    tokio::task::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut io = hyper_util::rt::TokioIo::new(upgraded);
                pump(&mut io, id, frame_tx.clone(), stream_rx).await;
            }
            Err(e) => {
                warn!(error = %e, "CONNECT upgrade failed");
                let _ = frame_tx
                    .send(Frame::ConnectClose(ConnectClosePayload {
                        id,
                        error: Some(format!("upgrade failed: {e}")),
                    }))
                    .await;
            }
        }
        table.deregister(&id);
    });

    Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .expect("static 200 response is always valid")
}

async fn pump(
    io: &mut hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>,
    id: StreamId,
    frame_tx: tunnel_mux::FrameSender,
    mut stream_rx: tunnel_mux::StreamReceiver,
) {
    let (mut reader, mut writer) = tokio::io::split(&mut *io);
    let mut buf = [0u8; 16 * 1024];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        let _ = frame_tx.send(Frame::ConnectClose(ConnectClosePayload { id, error: None })).await;
                        break;
                    }
                    Ok(n) => {
                        let frame = Frame::ConnectData(ConnectDataPayload { id, chunk: buf[..n].to_vec() });
                        if frame_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "client read error, closing connect stream");
                        let _ = frame_tx
                            .send(Frame::ConnectClose(ConnectClosePayload { id, error: Some(e.to_string()) }))
                            .await;
                        break;
                    }
                }
            }
            frame = stream_rx.recv() => {
                match frame {
                    Some(Frame::ConnectData(payload)) => {
                        if writer.write_all(&payload.chunk).await.is_err() {
                            break;
                        }
                    }
                    Some(Frame::ConnectClose(payload)) => {
                        if let Some(err) = payload.error {
                            debug!(error = %err, "tunnel closed connect stream");
                        }
                        break;
                    }
                    Some(other) => {
                        warn!(frame_type = other.type_name(), "unexpected frame on connect stream");
                    }
                    None => break,
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

fn status_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .header("X-Error", message)
        .body(full_body(bytes::Bytes::from(message.to_string())))
        .expect("static status responses are always valid")
}
