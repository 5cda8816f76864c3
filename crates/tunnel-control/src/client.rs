//! The out-of-band `wake`/`query`/`kill` control-plane operations (§6),
//! bypassing the tunnel entirely and signed per [`crate::signing`]. Retry
//! policy reuses [`tunnel_cert::Backoff`] — the same curve the CSR signing
//! client uses — per the Design Note that retry, backoff, and circuit
//! breaking are orthogonal policies composable at the call site.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use tunnel_cert::Backoff;

use crate::signing::sign_request;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const QUERY_POLL_INTERVAL: Duration = Duration::from_secs(5);
const QUERY_OVERALL_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control-plane request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("control-plane returned an error response: {0}")]
    Rejected(String),
    #[error("server did not become ready within {0:?}")]
    QueryTimedOut(Duration),
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterService {
    pub cluster: String,
    pub service: String,
}

#[derive(Debug, Deserialize)]
pub struct WakeResponse {
    pub status_code: u16,
    pub message: String,
    pub estimated_start_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum QueryResponse {
    Ready {
        instance_id: String,
        public_ip: String,
    },
    NotReady {
        not_ready: bool,
    },
}

#[derive(Debug, Deserialize)]
pub struct KillResponse {
    pub status: String,
    pub message: String,
}

/// Authenticated client for the three control-plane operations. Opaque
/// beyond the request/response shapes named in §6 — the cloud-specific
/// implementation behind `base_url` is out of scope here.
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    key_id: String,
    secret: String,
    backoff: Backoff,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>, key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build control-plane HTTP client"),
            base_url: base_url.into(),
            key_id: key_id.into(),
            secret: secret.into(),
            backoff: Backoff::STANDARD,
        }
    }

    fn signed_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let header = sign_request(&self.key_id, &self.secret, method.as_str(), path);
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", header)
    }

    /// `wake({cluster, service}) -> {status_code, message, estimated_start_time}`,
    /// idempotent, retried with the standard backoff curve.
    pub async fn wake(&self, target: &ClusterService) -> Result<WakeResponse, ControlError> {
        self.backoff
            .retry("control-wake", || async {
                let resp = self
                    .signed_request(reqwest::Method::POST, "/v1/wake")
                    .json(target)
                    .send()
                    .await?;
                decode(resp).await
            })
            .await
    }

    async fn query_once(&self, target: &ClusterService) -> Result<QueryResponse, ControlError> {
        let resp = self
            .signed_request(reqwest::Method::POST, "/v1/query")
            .json(target)
            .send()
            .await?;
        decode(resp).await
    }

    /// Polls `query` every 5s until it reports readiness or the overall 90s
    /// timeout elapses (§4.8).
    pub async fn query_until_ready(
        &self,
        target: &ClusterService,
    ) -> Result<(String, String), ControlError> {
        let deadline = tokio::time::Instant::now() + QUERY_OVERALL_TIMEOUT;
        loop {
            match self.query_once(target).await? {
                QueryResponse::Ready {
                    instance_id,
                    public_ip,
                } => return Ok((instance_id, public_ip)),
                QueryResponse::NotReady { .. } => {
                    debug!("server not ready yet, polling again");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ControlError::QueryTimedOut(QUERY_OVERALL_TIMEOUT));
            }
            tokio::time::sleep(QUERY_POLL_INTERVAL).await;
        }
    }

    /// `kill({cluster, service}) -> {status, message}`, idempotent. Calling
    /// it when the service is already stopped returns success without side
    /// effects, per the platform's contract — this client does not special
    /// case that, it only forwards the response.
    pub async fn kill(&self, target: &ClusterService) -> Result<KillResponse, ControlError> {
        self.backoff
            .retry("control-kill", || async {
                let resp = self
                    .signed_request(reqwest::Method::POST, "/v1/kill")
                    .json(target)
                    .send()
                    .await?;
                decode(resp).await
            })
            .await
    }
}

async fn decode<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T, ControlError> {
    if !resp.status().is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ControlError::Rejected(body));
    }
    resp.json().await.map_err(ControlError::Transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_response_deserializes_the_ready_variant() {
        let json = r#"{"instance_id":"arn:aws:ecs:us-east-1:123456789012:task/c/abc","public_ip":"54.1.2.3"}"#;
        let parsed: QueryResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, QueryResponse::Ready { .. }));
    }

    #[test]
    fn query_response_deserializes_the_not_ready_variant() {
        let json = r#"{"not_ready":true}"#;
        let parsed: QueryResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, QueryResponse::NotReady { not_ready: true }));
    }
}
