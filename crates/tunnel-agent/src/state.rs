//! Shared state the proxy listener and the lifecycle controller both touch:
//! the lifecycle installs a fresh [`ActiveTunnel`] whenever a transport
//! connects and clears it on disconnect; the proxy handlers only ever read
//! the current snapshot, never block on its absence.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tunnel_mux::{FrameSender, StreamTable};

/// One live transport connection: the sender half any local task can use to
/// emit frames, and the table the multiplexer's read loop routes inbound
/// frames through.
pub struct ActiveTunnel {
    pub frame_tx: FrameSender,
    pub table: Arc<StreamTable>,
}

#[derive(Default)]
pub struct AgentState {
    active: ArcSwapOption<ActiveTunnel>,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, tunnel: ActiveTunnel) {
        self.active.store(Some(Arc::new(tunnel)));
    }

    pub fn clear(&self) {
        self.active.store(None);
    }

    pub fn current(&self) -> Option<Arc<ActiveTunnel>> {
        self.active.load_full()
    }

    pub fn is_connected(&self) -> bool {
        self.active.load().is_some()
    }
}
