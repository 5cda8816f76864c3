//! Submits a CSR to the signing authority's HTTP endpoint (§6) with the
//! standard backoff and circuit breaker from [`crate::retry`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{Backoff, CircuitBreaker, CircuitBreakerError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SigningClientError {
    #[error("signing authority rejected the request: {0}")]
    Rejected(String),
    #[error("request to signing authority failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("circuit open, signing authority considered unavailable")]
    CircuitOpen,
}

impl From<CircuitBreakerError<SigningClientError>> for SigningClientError {
    fn from(e: CircuitBreakerError<SigningClientError>) -> Self {
        match e {
            CircuitBreakerError::Open(_) => SigningClientError::CircuitOpen,
            CircuitBreakerError::Inner(inner) => inner,
        }
    }
}

#[derive(Serialize)]
struct SignRequest<'a> {
    csr: &'a str,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SignResponse {
    Ok { certificate: String },
    Err { error: String },
}

/// One CSR submission, retried and circuit-broken per endpoint.
pub struct SigningClient {
    http: reqwest::Client,
    endpoint: String,
    backoff: Backoff,
    breaker: CircuitBreaker,
}

impl SigningClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build signing-authority HTTP client"),
            endpoint: endpoint.into(),
            backoff: Backoff::STANDARD,
            breaker: CircuitBreaker::standard(),
        }
    }

    pub async fn submit(&self, csr_pem: &str) -> Result<String, SigningClientError> {
        self.breaker
            .call(|| self.backoff.retry("sign-csr", || self.submit_once(csr_pem)))
            .await
            .map_err(SigningClientError::from)
    }

    async fn submit_once(&self, csr_pem: &str) -> Result<String, SigningClientError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&SignRequest { csr: csr_pem })
            .send()
            .await?;
        let body: SignResponse = resp.json().await?;
        match body {
            SignResponse::Ok { certificate } => Ok(certificate),
            SignResponse::Err { error } => Err(SigningClientError::Rejected(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn maps_a_circuit_open_error_to_circuit_open_variant() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        let _ = breaker
            .call(|| async { Err::<(), SigningClientError>(SigningClientError::Rejected("x".into())) })
            .await;
        let result = breaker.call(|| async { Ok::<(), SigningClientError>(()) }).await;
        let mapped = result.map_err(SigningClientError::from);
        assert!(matches!(mapped, Err(SigningClientError::CircuitOpen)));
    }
}
