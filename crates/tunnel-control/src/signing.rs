//! Control-plane request signing (§6). Adapted from
//! `auth::hmac::validate_proxy_auth`'s Basic-auth HMAC scheme, reshaped for
//! a request signature header instead of a proxy credential: the key
//! material is the shared secret provisioned alongside each instance's
//! identity, not a single proxy-wide password, and the signed string covers
//! the method and path rather than only a timestamp.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TOLERANCE_SECS: u64 = 300;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SigningError {
    #[error("missing Authorization header")]
    MissingHeader,
    #[error("Authorization header is not in the expected Signature scheme")]
    MalformedHeader,
    #[error("timestamp is not a valid unix epoch integer")]
    BadTimestamp,
    #[error("timestamp outside the tolerance window")]
    TimestampExpired,
    #[error("signature does not match")]
    SignatureMismatch,
}

/// Computes `Authorization: Signature keyId={key_id},ts={ts},sig={sig}` for
/// `method`+`path`, where `sig` is hex(HMAC-SHA256(secret,
/// "{method}\n{path}\n{ts}")).
pub fn sign_request(key_id: &str, secret: &str, method: &str, path: &str) -> String {
    let ts = now_secs();
    let sig = compute_signature(secret, method, path, ts);
    format!("Signature keyId={key_id},ts={ts},sig={sig}")
}

/// Validates a previously-computed header against the expected method,
/// path, and secret. Mirrors `validate_proxy_auth`'s flow: parse, check the
/// timestamp window, recompute, compare in constant time.
pub fn verify_request(
    header: Option<&str>,
    secret: &str,
    method: &str,
    path: &str,
    tolerance_secs: u64,
) -> Result<(), SigningError> {
    let header = header.ok_or(SigningError::MissingHeader)?;
    let rest = header
        .strip_prefix("Signature ")
        .ok_or(SigningError::MalformedHeader)?;

    let mut ts: Option<u64> = None;
    let mut sig: Option<&str> = None;
    for field in rest.split(',') {
        let (k, v) = field.split_once('=').ok_or(SigningError::MalformedHeader)?;
        match k {
            "ts" => ts = Some(v.parse().map_err(|_| SigningError::BadTimestamp)?),
            "sig" => sig = Some(v),
            _ => {}
        }
    }
    let ts = ts.ok_or(SigningError::MalformedHeader)?;
    let sig = sig.ok_or(SigningError::MalformedHeader)?;

    let now = now_secs();
    if now.abs_diff(ts) > tolerance_secs {
        return Err(SigningError::TimestampExpired);
    }

    let expected = compute_signature(secret, method, path, ts);
    if sig.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
        return Err(SigningError::SignatureMismatch);
    }
    Ok(())
}

pub fn default_tolerance_secs() -> u64 {
    DEFAULT_TOLERANCE_SECS
}

fn compute_signature(secret: &str, method: &str, path: &str, ts: u64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(format!("{method}\n{path}\n{ts}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// Decodes a base64-encoded shared secret the way provisioning hands it out
/// (so callers never pass a raw key around in plaintext env files).
pub fn decode_secret(encoded: &str) -> Result<String, base64::DecodeError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
    Ok(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_freshly_signed_request_verifies() {
        let header = sign_request("key-1", "shared-secret", "POST", "/v1/wake");
        assert!(verify_request(
            Some(&header),
            "shared-secret",
            "POST",
            "/v1/wake",
            300
        )
        .is_ok());
    }

    #[test]
    fn a_tampered_path_fails_verification() {
        let header = sign_request("key-1", "shared-secret", "POST", "/v1/wake");
        let result = verify_request(Some(&header), "shared-secret", "POST", "/v1/kill", 300);
        assert_eq!(result, Err(SigningError::SignatureMismatch));
    }

    #[test]
    fn a_stale_timestamp_is_rejected_even_with_a_correct_signature() {
        let secret = "shared-secret";
        let ts = now_secs() - 10_000;
        let sig = compute_signature(secret, "GET", "/v1/query", ts);
        let header = format!("Signature keyId=key-1,ts={ts},sig={sig}");
        let result = verify_request(Some(&header), secret, "GET", "/v1/query", 300);
        assert_eq!(result, Err(SigningError::TimestampExpired));
    }

    #[test]
    fn missing_header_is_reported_distinctly() {
        assert_eq!(
            verify_request(None, "secret", "GET", "/v1/query", 300),
            Err(SigningError::MissingHeader)
        );
    }
}
