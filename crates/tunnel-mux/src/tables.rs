//! Per-stream-ID routing table shared by the multiplexer's read loop and
//! whichever local task owns each stream. Generalizes the single
//! `HashMap<u32, mpsc::Sender<Frame>>` a tunnel dispatcher keeps for one
//! traffic class into a concurrent map usable from many origin points at
//! once, since a mutliplexed connection here carries three independent
//! traffic classes rather than one.
//!
//! Overflow policy differs by traffic class (§3): a raw-TCP stream
//! (`connect_data`) drops the oldest buffered frame so the tunnel tracks the
//! live socket rather than falling further and further behind, while every
//! other stream type drops the incoming frame and leaves what's already
//! queued alone. `tokio::sync::mpsc` can only ever drop the incoming item on
//! a full channel, so the per-stream queue here is a small hand-rolled one
//! instead: a mutex-guarded ring plus a `Notify` for the waiting side.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::Notify;
use tunnel_protocol::{Frame, StreamId};

const STREAM_CHANNEL_CAPACITY: usize = 64;

struct StreamChannel {
    queue: Mutex<VecDeque<Frame>>,
    notify: Notify,
    closed: AtomicBool,
}

impl StreamChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(STREAM_CHANNEL_CAPACITY)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Drop-incoming policy: refuses the frame once the queue is full,
    /// leaving everything already buffered untouched.
    fn push_drop_incoming(&self, frame: Frame) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= STREAM_CHANNEL_CAPACITY {
            return false;
        }
        queue.push_back(frame);
        drop(queue);
        self.notify.notify_one();
        true
    }

    /// Drop-oldest policy: evicts the front of the queue once full, then
    /// always enqueues the new frame.
    fn push_drop_oldest(&self, frame: Frame) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let evicted = if queue.len() >= STREAM_CHANNEL_CAPACITY {
            queue.pop_front();
            true
        } else {
            false
        };
        queue.push_back(frame);
        drop(queue);
        self.notify.notify_one();
        evicted
    }

    async fn recv(&self) -> Option<Frame> {
        loop {
            {
                let mut queue = self.queue.lock().unwrap();
                if let Some(frame) = queue.pop_front() {
                    return Some(frame);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// The receiving half returned by [`StreamTable::register`]. Exposes the
/// same `recv` shape as `tokio::sync::mpsc::Receiver` so stream handlers
/// don't need to know the queue underneath is shared with the table's
/// routing side.
pub struct StreamReceiver {
    channel: Arc<StreamChannel>,
}

impl StreamReceiver {
    pub async fn recv(&mut self) -> Option<Frame> {
        self.channel.recv().await
    }
}

/// Tracks every stream this endpoint currently has open, whether it
/// originated locally (http request, connect dial, websocket open) or was
/// accepted from the peer. Frames matching a registered stream id are
/// delivered to that stream's channel by the multiplexer's read loop;
/// frames with no match open a new stream via the multiplexer's inbound
/// handler.
#[derive(Default)]
pub struct StreamTable {
    inner: DashMap<StreamId, Arc<StreamChannel>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh stream and returns the receiving half of its
    /// channel. Must be called before any frame bearing `id` can be routed.
    pub fn register(&self, id: StreamId) -> StreamReceiver {
        let channel = StreamChannel::new();
        self.inner.insert(id, Arc::clone(&channel));
        StreamReceiver { channel }
    }

    pub fn deregister(&self, id: &StreamId) {
        if let Some((_, channel)) = self.inner.remove(id) {
            channel.close();
        }
    }

    pub fn contains(&self, id: &StreamId) -> bool {
        self.inner.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Routes `frame` to its registered stream, if any, applying the
    /// overflow policy its traffic class calls for: `connect_data` evicts
    /// the oldest queued frame, everything else drops the frame that just
    /// arrived.
    pub fn route(&self, frame: Frame) -> RouteOutcome {
        let id = frame.stream_id();
        let is_raw_tcp = matches!(frame, Frame::ConnectData(_));
        match self.inner.get(&id) {
            Some(channel) => {
                if is_raw_tcp {
                    channel.push_drop_oldest(frame);
                    RouteOutcome::Delivered
                } else if channel.push_drop_incoming(frame) {
                    RouteOutcome::Delivered
                } else {
                    RouteOutcome::Dropped
                }
            }
            None => RouteOutcome::Unknown,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// The stream is registered but its handler's channel is full.
    Dropped,
    /// No stream is registered for this frame's id — the caller should
    /// treat it as potentially opening a new inbound stream.
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_protocol::{ConnectAckPayload, ConnectDataPayload, WsMessagePayload, WsMessageType};

    fn ack(id: StreamId) -> Frame {
        Frame::ConnectAck(ConnectAckPayload {
            id,
            ok: true,
            error: None,
        })
    }

    fn connect_data(id: StreamId, tag: u8) -> Frame {
        Frame::ConnectData(ConnectDataPayload { id, chunk: vec![tag] })
    }

    fn ws_message(id: StreamId, tag: u8) -> Frame {
        Frame::WsMessage(WsMessagePayload {
            id,
            message_type: WsMessageType::Binary,
            data: vec![tag],
        })
    }

    fn connect_data_tag(frame: &Frame) -> u8 {
        match frame {
            Frame::ConnectData(p) => p.chunk[0],
            _ => panic!("expected connect_data"),
        }
    }

    fn ws_message_tag(frame: &Frame) -> u8 {
        match frame {
            Frame::WsMessage(p) => p.data[0],
            _ => panic!("expected ws_message"),
        }
    }

    #[tokio::test]
    async fn routes_a_frame_to_its_registered_stream() {
        let table = StreamTable::new();
        let id = StreamId::new();
        let mut rx = table.register(id);
        assert_eq!(table.route(ack(id)), RouteOutcome::Delivered);
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.stream_id(), id);
    }

    #[tokio::test]
    async fn reports_unknown_for_an_unregistered_stream() {
        let table = StreamTable::new();
        assert_eq!(table.route(ack(StreamId::new())), RouteOutcome::Unknown);
    }

    #[tokio::test]
    async fn deregister_removes_the_stream() {
        let table = StreamTable::new();
        let id = StreamId::new();
        let _rx = table.register(id);
        table.deregister(&id);
        assert_eq!(table.route(ack(id)), RouteOutcome::Unknown);
    }

    #[tokio::test]
    async fn deregister_wakes_a_pending_recv_with_none() {
        let table = StreamTable::new();
        let id = StreamId::new();
        let mut rx = table.register(id);
        table.deregister(&id);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn raw_tcp_overflow_drops_the_oldest_frame_and_keeps_the_newest() {
        let table = StreamTable::new();
        let id = StreamId::new();
        let mut rx = table.register(id);

        for tag in 0..STREAM_CHANNEL_CAPACITY as u8 {
            assert_eq!(table.route(connect_data(id, tag)), RouteOutcome::Delivered);
        }
        // One more than capacity: the oldest (tag 0) should be evicted, not the newest.
        assert_eq!(
            table.route(connect_data(id, STREAM_CHANNEL_CAPACITY as u8)),
            RouteOutcome::Delivered
        );

        let first = rx.recv().await.unwrap();
        assert_eq!(connect_data_tag(&first), 1, "oldest frame (tag 0) should have been dropped");

        let mut last_tag = 0u8;
        let mut count = 1;
        while let Ok(Some(frame)) = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await {
            last_tag = connect_data_tag(&frame);
            count += 1;
        }
        assert_eq!(count, STREAM_CHANNEL_CAPACITY, "queue should still hold exactly capacity frames");
        assert_eq!(last_tag, STREAM_CHANNEL_CAPACITY as u8, "newest frame must survive");
    }

    #[tokio::test]
    async fn non_raw_tcp_overflow_drops_the_incoming_frame_and_keeps_what_was_queued() {
        let table = StreamTable::new();
        let id = StreamId::new();
        let mut rx = table.register(id);

        for tag in 0..STREAM_CHANNEL_CAPACITY as u8 {
            assert_eq!(table.route(ws_message(id, tag)), RouteOutcome::Delivered);
        }
        // One more than capacity: this frame is the one dropped, not anything queued.
        assert_eq!(
            table.route(ws_message(id, STREAM_CHANNEL_CAPACITY as u8)),
            RouteOutcome::Dropped
        );

        let first = rx.recv().await.unwrap();
        assert_eq!(ws_message_tag(&first), 0, "oldest frame must survive a drop-incoming overflow");

        let mut last_tag = 0u8;
        let mut count = 1;
        while let Ok(Some(frame)) = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await {
            last_tag = ws_message_tag(&frame);
            count += 1;
        }
        assert_eq!(count, STREAM_CHANNEL_CAPACITY);
        assert_eq!(last_tag, STREAM_CHANNEL_CAPACITY as u8 - 1, "the would-be 65th frame must never appear");
    }
}
