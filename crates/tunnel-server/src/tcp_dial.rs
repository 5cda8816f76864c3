//! Raw TCP tunnel path (§4.5/§4.6): dial the target with a 10s context, ack,
//! then pump `connect_data` frames in both directions with a 5-minute
//! sliding idle-read deadline to reap abandoned Internet sockets.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use tunnel_mux::{FrameSender, StreamReceiver};
use tunnel_protocol::{ConnectAckPayload, ConnectClosePayload, ConnectDataPayload, ConnectOpenPayload, Frame, StreamId};

use crate::state::ServerState;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub async fn handle(
    state: Arc<ServerState>,
    open: ConnectOpenPayload,
    stream_rx: StreamReceiver,
    reply_tx: FrameSender,
) {
    state.touch_activity();
    let id = open.id;

    let target = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&open.address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(stream = %id, address = %open.address, error = %e, "connect_open dial failed");
            send_close(&reply_tx, id, Some(e.to_string())).await;
            return;
        }
        Err(_) => {
            warn!(stream = %id, address = %open.address, "connect_open dial timed out");
            send_close(&reply_tx, id, Some("connection timeout".to_string())).await;
            return;
        }
    };
    let _ = target.set_nodelay(true);

    debug!(stream = %id, address = %open.address, "connect_open dial succeeded");
    let _ = reply_tx
        .send(Frame::ConnectAck(ConnectAckPayload { id, ok: true, error: None }))
        .await;

    pump(state, id, target, stream_rx, reply_tx).await;
}

async fn pump(
    state: Arc<ServerState>,
    id: StreamId,
    mut target: TcpStream,
    mut stream_rx: StreamReceiver,
    reply_tx: FrameSender,
) {
    let (mut reader, mut writer) = target.split();
    let mut buf = [0u8; 16 * 1024];

    loop {
        tokio::select! {
            read = tokio::time::timeout(IDLE_TIMEOUT, reader.read(&mut buf)) => {
                match read {
                    Ok(Ok(0)) => {
                        send_close(&reply_tx, id, None).await;
                        break;
                    }
                    Ok(Ok(n)) => {
                        state.touch_activity();
                        let frame = Frame::ConnectData(ConnectDataPayload { id, chunk: buf[..n].to_vec() });
                        if reply_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        debug!(stream = %id, error = %e, "target read error");
                        send_close(&reply_tx, id, Some(e.to_string())).await;
                        break;
                    }
                    Err(_) => {
                        debug!(stream = %id, "idle read deadline exceeded, closing");
                        send_close(&reply_tx, id, Some("idle timeout".to_string())).await;
                        break;
                    }
                }
            }
            frame = stream_rx.recv() => {
                match frame {
                    Some(Frame::ConnectData(payload)) => {
                        state.touch_activity();
                        if writer.write_all(&payload.chunk).await.is_err() {
                            break;
                        }
                    }
                    Some(Frame::ConnectClose(payload)) => {
                        if let Some(err) = payload.error {
                            debug!(stream = %id, error = %err, "agent closed connect stream");
                        }
                        break;
                    }
                    Some(other) => {
                        warn!(stream = %id, frame_type = other.type_name(), "unexpected frame on connect stream");
                    }
                    None => break,
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn send_close(reply_tx: &FrameSender, id: StreamId, error: Option<String>) {
    let _ = reply_tx.send(Frame::ConnectClose(ConnectClosePayload { id, error })).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    /// `handle()`'s dial itself can't be made to hang deterministically
    /// without depending on OS-specific TCP retransmit timing, so this
    /// exercises the same `tokio::time::timeout(DIAL_TIMEOUT, ...)` wrapping
    /// `handle` uses, with virtual time advanced past it, to confirm a dial
    /// that never resolves is turned into a `connect_close` rather than
    /// left to hang forever.
    #[tokio::test(start_paused = true)]
    async fn a_dial_that_never_resolves_times_out_after_dial_timeout() {
        let id = StreamId::new();
        let (reply_tx, mut reply_rx) = mpsc::channel(1);

        let dial = tokio::time::timeout(DIAL_TIMEOUT, std::future::pending::<std::io::Result<TcpStream>>());
        tokio::pin!(dial);

        tokio::time::advance(DIAL_TIMEOUT + Duration::from_millis(1)).await;
        match dial.await {
            Ok(_) => panic!("expected the dial to time out"),
            Err(_) => send_close(&reply_tx, id, Some("connection timeout".to_string())).await,
        }

        match reply_rx.recv().await.unwrap() {
            Frame::ConnectClose(payload) => {
                assert_eq!(payload.id, id);
                assert_eq!(payload.error.as_deref(), Some("connection timeout"));
            }
            other => panic!("expected connect_close, got {}", other.type_name()),
        }
    }
}
