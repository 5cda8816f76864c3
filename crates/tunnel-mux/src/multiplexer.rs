//! Stream multiplexer: one dispatch loop and one writer task share a single
//! transport connection across all three traffic classes (HTTP, raw TCP
//! tunneling, WebSocket tunneling). Generalizes `tunnel::dispatcher::run`
//! and `tunnel::writer::spawn_writer`, which each handle one traffic class
//! over a WebSocket, to a length-prefixed JSON frame connection carrying
//! three.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
#[cfg(test)]
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, warn};
use tunnel_protocol::{DecodedFrame, Frame, FrameCodec, ProtocolError};

use crate::tables::{RouteOutcome, StreamReceiver, StreamTable};

pub type FrameSender = mpsc::Sender<Frame>;

const WRITER_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum MultiplexerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("peer closed the connection")]
    Closed,
}

/// Delivers frames that open a new stream (`http_request`, `connect_open`,
/// `ws_open`) to whichever side owns stream handling. The agent and the
/// server each implement this once, with entirely different bodies, which
/// is why it lives behind a trait here rather than a closure baked into the
/// dispatch loop.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_new_stream(
        &self,
        opening_frame: Frame,
        stream_rx: StreamReceiver,
        reply_tx: FrameSender,
    );
}

fn is_opening_frame(frame: &Frame) -> bool {
    matches!(
        frame,
        Frame::HttpRequest(_) | Frame::ConnectOpen(_) | Frame::WsOpen(_)
    )
}

/// Spawns the writer task and the dispatch loop for one transport
/// connection. Returns a sender any local task can use to emit frames, and
/// a handle that resolves once the connection is lost (from either
/// direction) — races the dispatcher against the writer so a silently dead
/// write-half is detected instead of leaving the read loop blocked forever.
pub fn spawn<S, H>(
    stream: S,
    table: Arc<StreamTable>,
    inbound: Arc<H>,
) -> (FrameSender, JoinHandle<Result<(), MultiplexerError>>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    H: InboundHandler + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = FramedRead::new(read_half, FrameCodec);
    let writer = FramedWrite::new(write_half, FrameCodec);

    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(WRITER_QUEUE_CAPACITY);
    let writer_handle = spawn_writer(writer, frame_rx);

    let dispatch_tx = frame_tx.clone();
    let handle = tokio::spawn(async move {
        tokio::select! {
            result = dispatch_loop(reader, table, inbound, dispatch_tx) => result,
            writer_result = writer_handle => {
                match writer_result {
                    Ok(Ok(())) => warn!("writer task exited normally, closing connection"),
                    Ok(Err(e)) => error!(error = %e, "writer task failed"),
                    Err(e) => error!(error = %e, "writer task panicked"),
                }
                Err(MultiplexerError::Closed)
            }
        }
    });

    (frame_tx, handle)
}

fn spawn_writer<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::Receiver<Frame>,
) -> JoinHandle<Result<(), MultiplexerError>>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                error!(error = %e, "failed to write frame to transport");
                return Err(e.into());
            }
        }
        debug!("writer task exiting, sender side dropped");
        Ok(())
    })
}

async fn dispatch_loop<R, H>(
    mut reader: FramedRead<R, FrameCodec>,
    table: Arc<StreamTable>,
    inbound: Arc<H>,
    reply_tx: FrameSender,
) -> Result<(), MultiplexerError>
where
    R: AsyncRead + Send + Unpin + 'static,
    H: InboundHandler + 'static,
{
    loop {
        let frame = match reader.next().await {
            Some(Ok(DecodedFrame::Known(frame))) => frame,
            Some(Ok(DecodedFrame::Unknown(type_name))) => {
                debug!(frame_type = %type_name, "unrecognized frame type, logged and dropped");
                continue;
            }
            Some(Err(e)) => {
                warn!(error = %e, "failed to decode frame, dropping connection");
                return Err(e.into());
            }
            None => {
                debug!("transport closed by peer");
                return Err(MultiplexerError::Closed);
            }
        };

        if is_opening_frame(&frame) {
            let id = frame.stream_id();
            if table.contains(&id) {
                warn!(stream = %id, "duplicate open for an already-registered stream id, ignoring");
                continue;
            }
            let stream_rx = table.register(id);
            let handler = Arc::clone(&inbound);
            let reply = reply_tx.clone();
            tokio::spawn(async move {
                handler.handle_new_stream(frame, stream_rx, reply).await;
            });
            continue;
        }

        match table.route(frame) {
            RouteOutcome::Delivered => {}
            RouteOutcome::Dropped => warn!("stream handler channel full, frame dropped"),
            RouteOutcome::Unknown => debug!("frame for unknown or already-closed stream, dropped"),
        }
    }
}
