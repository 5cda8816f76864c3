//! Shared server state: the reqwest client the dispatcher executes upstream
//! calls through, the retry/circuit-break policy it executes them under,
//! and the connection accounting the health endpoint reports.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tunnel_cert::{Backoff, CircuitBreaker};

pub struct ServerState {
    pub reqwest_client: reqwest::Client,
    pub circuit_breaker: CircuitBreaker,
    pub backoff: Backoff,
    pub max_connections: usize,
    active_connections: AtomicUsize,
    last_activity_millis: AtomicI64,
    started_at: Instant,
}

impl ServerState {
    pub fn new(reqwest_client: reqwest::Client, max_connections: usize) -> Self {
        Self {
            reqwest_client,
            circuit_breaker: CircuitBreaker::standard(),
            backoff: Backoff::STANDARD,
            max_connections,
            active_connections: AtomicUsize::new(0),
            last_activity_millis: AtomicI64::new(now_millis()),
            started_at: Instant::now(),
        }
    }

    pub fn touch_activity(&self) {
        self.last_activity_millis.store(now_millis(), Ordering::Relaxed);
    }

    pub fn last_activity_millis(&self) -> i64 {
        self.last_activity_millis.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
