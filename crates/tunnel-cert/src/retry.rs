//! Exponential backoff and circuit breaking, hand-rolled rather than pulling
//! in a retry crate. The two policies are orthogonal and composable at the
//! call site (Design Note, §9).

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

/// Exponential backoff curve shared by CSR signing (§4.3), the lifecycle's
/// wake/query retries (§4.8), and the dispatcher's per-request retry (§4.6).
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_attempts: u32,
    pub initial: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl Backoff {
    /// The standard retry curve: 3 attempts, 500ms initial, x2, capped at 5s.
    pub const STANDARD: Backoff = Backoff {
        max_attempts: 3,
        initial: Duration::from_millis(500),
        multiplier: 2.0,
        cap: Duration::from_secs(5),
    };

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled).min(self.cap)
    }

    /// Run `op` up to `max_attempts` times, sleeping the backoff curve
    /// between attempts. Returns the last error if every attempt fails.
    pub async fn retry<T, E, F, Fut>(&self, label: &str, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.retry_if(label, op, |_| true).await
    }

    /// Like [`Self::retry`], but `is_retryable` can stop the loop without
    /// spending a backoff delay on errors the caller already knows are
    /// permanent (e.g. connection refused vs a timeout, §7).
    pub async fn retry_if<T, E, F, Fut>(
        &self,
        label: &str,
        mut op: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if !is_retryable(&e) {
                        debug!(label, attempt, error = %e, "permanent failure, not retrying");
                        return Err(e);
                    }
                    if attempt >= self.max_attempts {
                        warn!(label, attempt, error = %e, "retry exhausted");
                        return Err(e);
                    }
                    let delay = self.delay_for_attempt(attempt - 1);
                    debug!(label, attempt, delay_ms = delay.as_millis(), error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// A three-state circuit breaker: Closed (normal), Open (fail fast), and
/// HalfOpen (one trial call allowed after the reset window elapses).
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_after: Duration,
    consecutive_failures: AtomicU32,
    opened_at_millis: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
#[error("circuit breaker open, retry after the reset window")]
pub struct CircuitOpenError;

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_after: Duration) -> Self {
        Self {
            failure_threshold,
            reset_after,
            consecutive_failures: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
        }
    }

    /// The breaker named in §4.3: opens after 3 consecutive failures,
    /// half-opens after 30s.
    pub fn standard() -> Self {
        Self::new(3, Duration::from_secs(30))
    }

    fn is_open(&self) -> bool {
        let opened_at = self.opened_at_millis.load(Ordering::Acquire);
        if opened_at == 0 {
            return false;
        }
        let elapsed_ms = now_millis().saturating_sub(opened_at);
        elapsed_ms < self.reset_after.as_millis() as u64
    }

    fn on_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.opened_at_millis.store(0, Ordering::Release);
    }

    fn on_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.failure_threshold {
            self.opened_at_millis.store(now_millis(), Ordering::Release);
        }
    }

    /// Run `op` unless the breaker is open, in which case fail fast with
    /// [`CircuitOpenError`] without invoking `op` at all.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.is_open() {
            return Err(CircuitBreakerError::Open(CircuitOpenError));
        }
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error(transparent)]
    Open(CircuitOpenError),
    #[error(transparent)]
    Inner(E),
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Measures elapsed wall-clock time for logging without depending on a
/// monotonic-clock abstraction at every call site.
pub fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
