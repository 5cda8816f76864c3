//! Server-side HTTP dispatcher (§4.6). The wire format here carries the
//! whole request body in the opening frame rather than streaming it in
//! separate body frames, so there is no body-draining loop — one
//! `http_request` in, one `http_response` out, executed through the shared
//! circuit breaker and retry policy.

use std::sync::Arc;

use tracing::warn;
use tunnel_mux::FrameSender;
use tunnel_protocol::{Frame, HttpRequestPayload, HttpResponsePayload};

use crate::state::ServerState;

/// Whether a failed upstream call should be retried. Connection-refused
/// (and other dial failures) are a per-request permanent outcome — the
/// target is down, trying again on the same backoff curve just adds
/// latency — while a timeout is per-request transient (§7).
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
struct DispatchError {
    message: String,
    retryable: bool,
}

impl DispatchError {
    fn transient(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true }
    }

    fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false }
    }
}

pub async fn handle(state: Arc<ServerState>, request: HttpRequestPayload, reply_tx: FrameSender) {
    state.touch_activity();

    let id = request.id;
    let method = request.method.clone();
    let url = request.url.clone();

    let result = state
        .circuit_breaker
        .call(|| {
            let state = Arc::clone(&state);
            let request = request.clone();
            async move { execute_with_retry(&state, request).await }
        })
        .await;

    let response = match result {
        Ok(response) => response,
        Err(tunnel_cert::CircuitBreakerError::Open(_)) => {
            warn!(stream = %id, %method, %url, "circuit open, failing fast");
            error_response(id, 503, "circuit breaker open, upstream is unhealthy")
        }
        Err(tunnel_cert::CircuitBreakerError::Inner(reason)) => {
            warn!(stream = %id, %method, %url, error = %reason, "upstream call failed");
            error_response(id, 502, &reason.message)
        }
    };

    let _ = reply_tx.send(Frame::HttpResponse(response)).await;
}

async fn execute_with_retry(
    state: &ServerState,
    request: HttpRequestPayload,
) -> Result<HttpResponsePayload, DispatchError> {
    state
        .backoff
        .retry_if(
            "dispatch-http-request",
            || async { execute_once(state, &request).await },
            |e| e.retryable,
        )
        .await
}

/// Runs the upstream call once. A connect failure (target refused the
/// connection, DNS failed, etc.) is per-request permanent and propagated
/// verbatim without retrying; a timeout is per-request transient and the
/// backoff curve in [`execute_with_retry`] retries it (§7).
async fn execute_once(
    state: &ServerState,
    request: &HttpRequestPayload,
) -> Result<HttpResponsePayload, DispatchError> {
    let method: reqwest::Method = request
        .method
        .parse()
        .map_err(|_| DispatchError::permanent(format!("invalid method: {}", request.method)))?;

    let mut builder = state.reqwest_client.request(method, &request.url);
    for (name, values) in &request.headers {
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    if !request.body.is_empty() {
        builder = builder.body(request.body.clone());
    }

    let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
            DispatchError::transient("upstream timeout")
        } else if e.is_connect() {
            DispatchError::permanent(format!("upstream connect error: {e}"))
        } else {
            DispatchError::transient(format!("upstream error: {e}"))
        }
    })?;

    let status_code = response.status().as_u16();
    let mut headers: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers.entry(name.as_str().to_string()).or_default().push(v.to_string());
        }
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| DispatchError::transient(format!("body read error: {e}")))?;

    Ok(HttpResponsePayload {
        id: request.id,
        status_code,
        headers,
        body: body.to_vec(),
        error: None,
    })
}

fn error_response(id: tunnel_protocol::StreamId, status_code: u16, reason: &str) -> HttpResponsePayload {
    let mut headers = std::collections::HashMap::new();
    headers.insert("content-type".to_string(), vec!["text/plain".to_string()]);
    HttpResponsePayload {
        id,
        status_code,
        headers,
        body: format!("Tunnel error: {reason}").into_bytes(),
        error: Some(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ServerState;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tunnel_cert::{Backoff, CircuitBreaker};
    use tunnel_protocol::StreamId;

    fn sample_request(url: String) -> HttpRequestPayload {
        HttpRequestPayload {
            id: StreamId::new(),
            method: "GET".to_string(),
            url,
            headers: Default::default(),
            body: Vec::new(),
        }
    }

    fn fast_state(client: reqwest::Client) -> ServerState {
        let mut state = ServerState::new(client, 10);
        state.backoff = Backoff {
            max_attempts: 3,
            initial: Duration::from_millis(5),
            multiplier: 1.0,
            cap: Duration::from_millis(5),
        };
        state
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    async fn recv_response(rx: &mut mpsc::Receiver<Frame>) -> HttpResponsePayload {
        match rx.recv().await.unwrap() {
            Frame::HttpResponse(response) => response,
            other => panic!("expected http_response, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn a_connection_refused_target_is_propagated_without_retrying() {
        let port = closed_port().await;
        let state = Arc::new(fast_state(reqwest::Client::new()));
        let request = sample_request(format!("http://127.0.0.1:{port}/"));

        let (tx, mut rx) = mpsc::channel(1);
        handle(Arc::clone(&state), request, tx).await;

        let response = recv_response(&mut rx).await;
        assert_eq!(response.status_code, 502);
        assert!(response.error.unwrap().contains("connect error"));
    }

    #[tokio::test]
    async fn a_timeout_is_retried_up_to_the_backoff_limit() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_count = Arc::new(AtomicUsize::new(0));
        let accept_count_task = Arc::clone(&accept_count);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept_count_task.fetch_add(1, Ordering::SeqCst);
                // Never write a response, holding the socket open until
                // dropped so the client's request times out.
                tokio::time::sleep(Duration::from_secs(5)).await;
                drop(socket);
            }
        });

        let client = reqwest::Client::builder().timeout(Duration::from_millis(20)).build().unwrap();
        let state = Arc::new(fast_state(client));
        let request = sample_request(format!("http://{addr}/"));

        let (tx, mut rx) = mpsc::channel(1);
        handle(Arc::clone(&state), request, tx).await;

        let response = recv_response(&mut rx).await;
        assert_eq!(response.status_code, 502);
        assert!(
            accept_count.load(Ordering::SeqCst) >= 2,
            "a transient timeout should be retried, got {} attempts",
            accept_count.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn an_open_circuit_fails_fast_with_a_503() {
        let port = closed_port().await;
        let mut state = fast_state(reqwest::Client::new());
        state.circuit_breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        let state = Arc::new(state);

        let (tx, mut rx) = mpsc::channel(2);
        handle(Arc::clone(&state), sample_request(format!("http://127.0.0.1:{port}/")), tx.clone()).await;
        let first = recv_response(&mut rx).await;
        assert_eq!(first.status_code, 502);

        handle(Arc::clone(&state), sample_request(format!("http://127.0.0.1:{port}/")), tx).await;
        let second = recv_response(&mut rx).await;
        assert_eq!(second.status_code, 503);
    }
}
