//! Ties identity discovery, key caching, CSR composition, and the signing
//! client into the lazy, identity-bound certificate lifecycle described in
//! §4.3: a certificate is requested only once a peer address needs to be
//! authorized, and is re-issued whenever the known peer set grows.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use tracing::info;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, GeneralName, ParsedExtension, X509Certificate};

use crate::csr::{build_csr, CsrError};
use crate::identity::InstanceIdentity;
use crate::key::{initialize_key, write_atomically, KeyError};
use crate::signing_client::{SigningClient, SigningClientError};

const CERT_FILE_NAME: &str = "server.crt";

/// A certificate within this window of its expiry is treated as stale and
/// reissued even if its peer set hasn't grown (§4.3).
const REISSUE_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum CertManagerError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Csr(#[from] CsrError),
    #[error(transparent)]
    Signing(#[from] SigningClientError),
    #[error("issued certificate is not valid PEM/DER: {0}")]
    MalformedCert(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PeerValidationError {
    #[error("peer certificate is not valid DER: {0}")]
    MalformedCert(String),
    #[error("peer certificate common name {actual:?} does not match expected identity {expected:?}")]
    CommonNameMismatch { expected: String, actual: String },
    #[error("observed address {0} is not among the peer certificate's subject alternative names")]
    AddressNotAuthorized(Ipv4Addr),
}

/// A cached, on-disk certificate plus the key path it pairs with (§3).
#[derive(Debug, Clone)]
pub struct CertBundle {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    pub cert_pem: String,
    pub not_after: SystemTime,
}

impl CertBundle {
    /// True once the certificate is within [`REISSUE_WINDOW`] of expiry (or
    /// already past it), meaning `ensure_for_peer` must reissue even for an
    /// already-known peer.
    fn is_stale(&self) -> bool {
        match self.not_after.duration_since(SystemTime::now()) {
            Ok(remaining) => remaining < REISSUE_WINDOW,
            Err(_) => true,
        }
    }
}

/// Owns one endpoint's key, its current certificate, and the set of peer
/// addresses that certificate's SAN list has been issued to cover.
pub struct CertificateManager {
    cache_dir: PathBuf,
    identity: InstanceIdentity,
    own_address: Ipv4Addr,
    signing_client: SigningClient,
    known_peers: RwLock<BTreeSet<Ipv4Addr>>,
    current: RwLock<Option<CertBundle>>,
}

impl CertificateManager {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        identity: InstanceIdentity,
        own_address: Ipv4Addr,
        signing_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            identity,
            own_address,
            signing_client: SigningClient::new(signing_endpoint),
            known_peers: RwLock::new(BTreeSet::new()),
            current: RwLock::new(None),
        }
    }

    /// Loads or generates the RSA-2048 private key this endpoint signs its
    /// CSRs with. Must be called before [`Self::ensure_for_peer`].
    pub fn initialize_key(&self) -> Result<String, KeyError> {
        initialize_key(&self.cache_dir)
    }

    /// Idempotent: if `peer_ip` is already covered by the current
    /// certificate's address list and that certificate is not within 30
    /// days of expiry, returns it unchanged. Otherwise unions `peer_ip`
    /// into the known peer set, requests a fresh certificate whose SAN list
    /// is the endpoint's own address plus every known peer, and atomically
    /// replaces the cached bundle.
    pub async fn ensure_for_peer(
        &self,
        peer_ip: Ipv4Addr,
    ) -> Result<CertBundle, CertManagerError> {
        {
            let peers = self.known_peers.read().unwrap();
            if peers.contains(&peer_ip) {
                if let Some(bundle) = self.current.read().unwrap().clone() {
                    if !bundle.is_stale() {
                        return Ok(bundle);
                    }
                    info!(peer = %peer_ip, "cached certificate is within its reissue window, renewing");
                }
            }
        }

        let key_pem = self.initialize_key()?;

        let addresses = {
            let mut peers = self.known_peers.write().unwrap();
            peers.insert(peer_ip);
            let mut addrs: BTreeSet<Ipv4Addr> = peers.clone();
            addrs.insert(self.own_address);
            addrs
        };

        info!(peer = %peer_ip, count = addresses.len(), "requesting certificate covering expanded peer set");
        let csr_pem = build_csr(&self.identity, &addresses, &key_pem)?;
        let cert_pem = self.signing_client.submit(&csr_pem).await?;

        let not_after = cert_not_after(&cert_pem)?;

        let cert_path = self.cache_dir.join(CERT_FILE_NAME);
        write_atomically(&cert_path, cert_pem.as_bytes())?;

        let bundle = CertBundle {
            key_path: self.cache_dir.join("server.key"),
            cert_path,
            cert_pem,
            not_after,
        };
        *self.current.write().unwrap() = Some(bundle.clone());
        Ok(bundle)
    }

    pub fn current(&self) -> Option<CertBundle> {
        self.current.read().unwrap().clone()
    }
}

/// Validates a peer's certificate against both identity checks §4.3
/// requires: the subject common name must equal `expected_identity`, and
/// `observed_ip` must appear in the certificate's subject alternative name
/// list. Either failing independently is a rejection.
pub fn validate_peer(
    peer_cert_der: &[u8],
    expected_identity: &InstanceIdentity,
    observed_ip: Ipv4Addr,
) -> Result<(), PeerValidationError> {
    let (_, cert) = X509Certificate::from_der(peer_cert_der)
        .map_err(|e| PeerValidationError::MalformedCert(e.to_string()))?;

    let cn = common_name(&cert).unwrap_or_default();
    if cn != expected_identity.as_str() {
        return Err(PeerValidationError::CommonNameMismatch {
            expected: expected_identity.as_str().to_string(),
            actual: cn,
        });
    }

    if !subject_addresses(&cert).contains(&observed_ip) {
        return Err(PeerValidationError::AddressNotAuthorized(observed_ip));
    }

    Ok(())
}

/// Extracts the `notAfter` field of a freshly issued PEM certificate as a
/// [`SystemTime`], so staleness can be compared without re-parsing ASN.1
/// time on every `ensure_for_peer` call.
fn cert_not_after(cert_pem: &str) -> Result<SystemTime, CertManagerError> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| CertManagerError::MalformedCert(e.to_string()))?;
    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| CertManagerError::MalformedCert(e.to_string()))?;
    let timestamp = cert.validity().not_after.timestamp();
    let timestamp = u64::try_from(timestamp)
        .map_err(|_| CertManagerError::MalformedCert("notAfter predates the epoch".to_string()))?;
    Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(timestamp))
}

fn common_name(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
}

fn subject_addresses(cert: &X509Certificate<'_>) -> BTreeSet<Ipv4Addr> {
    let mut addresses = BTreeSet::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::IPAddress(bytes) = name {
                    if let Ok(octets) = <[u8; 4]>::try_from(*bytes) {
                        addresses.insert(Ipv4Addr::from(octets));
                    }
                }
            }
        }
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing_authority::SigningAuthority;

    fn der_from_pem(pem: &str) -> Vec<u8> {
        let (_, doc) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap();
        doc.contents
    }

    #[test]
    fn accepts_a_certificate_whose_cn_and_address_both_match() {
        let identity = InstanceIdentity::new("arn:aws:ecs:us-east-1:123456789012:task/c/abc");
        let mut addrs = BTreeSet::new();
        addrs.insert(Ipv4Addr::new(10, 0, 0, 5));
        let dir = tempfile::tempdir().unwrap();
        let key_pem = initialize_key(dir.path()).unwrap();
        let csr_pem = build_csr(&identity, &addrs, &key_pem).unwrap();

        let authority = SigningAuthority::new_self_signed().unwrap();
        let cert_pem = authority.issue(&csr_pem).unwrap();
        let der = der_from_pem(&cert_pem);

        validate_peer(&der, &identity, Ipv4Addr::new(10, 0, 0, 5)).unwrap();
    }

    #[test]
    fn rejects_an_address_outside_the_certificate_san_list() {
        let identity = InstanceIdentity::new("arn:aws:ecs:us-east-1:123456789012:task/c/abc");
        let mut addrs = BTreeSet::new();
        addrs.insert(Ipv4Addr::new(10, 0, 0, 5));
        let dir = tempfile::tempdir().unwrap();
        let key_pem = initialize_key(dir.path()).unwrap();
        let csr_pem = build_csr(&identity, &addrs, &key_pem).unwrap();

        let authority = SigningAuthority::new_self_signed().unwrap();
        let cert_pem = authority.issue(&csr_pem).unwrap();
        let der = der_from_pem(&cert_pem);

        let result = validate_peer(&der, &identity, Ipv4Addr::new(10, 0, 0, 9));
        assert!(matches!(
            result,
            Err(PeerValidationError::AddressNotAuthorized(_))
        ));
    }

    fn bundle_expiring_in(remaining: Duration) -> CertBundle {
        CertBundle {
            key_path: PathBuf::from("server.key"),
            cert_path: PathBuf::from("server.crt"),
            cert_pem: String::new(),
            not_after: SystemTime::now() + remaining,
        }
    }

    #[test]
    fn a_certificate_just_inside_the_reissue_window_is_stale() {
        let bundle = bundle_expiring_in(REISSUE_WINDOW - Duration::from_secs(1));
        assert!(bundle.is_stale());
    }

    #[test]
    fn a_certificate_just_outside_the_reissue_window_is_not_stale() {
        let bundle = bundle_expiring_in(REISSUE_WINDOW + Duration::from_secs(60));
        assert!(!bundle.is_stale());
    }

    #[test]
    fn an_already_expired_certificate_is_stale() {
        let bundle = CertBundle {
            key_path: PathBuf::from("server.key"),
            cert_path: PathBuf::from("server.crt"),
            cert_pem: String::new(),
            not_after: SystemTime::now() - Duration::from_secs(1),
        };
        assert!(bundle.is_stale());
    }

    #[test]
    fn cert_not_after_extracts_the_issued_certificates_expiry() {
        let identity = InstanceIdentity::new("arn:aws:ecs:us-east-1:123456789012:task/c/abc");
        let mut addrs = BTreeSet::new();
        addrs.insert(Ipv4Addr::new(10, 0, 0, 5));
        let dir = tempfile::tempdir().unwrap();
        let key_pem = initialize_key(dir.path()).unwrap();
        let csr_pem = build_csr(&identity, &addrs, &key_pem).unwrap();

        let authority = SigningAuthority::new_self_signed().unwrap();
        let cert_pem = authority.issue(&csr_pem).unwrap();

        let not_after = cert_not_after(&cert_pem).unwrap();
        let remaining = not_after.duration_since(SystemTime::now()).unwrap();
        // The reference authority issues 1-year certificates; allow slack
        // for test execution time without pinning an exact duration.
        assert!(remaining > Duration::from_secs(360 * 24 * 60 * 60));
    }

    #[test]
    fn rejects_a_mismatched_common_name() {
        let identity = InstanceIdentity::new("arn:aws:ecs:us-east-1:123456789012:task/c/abc");
        let other = InstanceIdentity::new("arn:aws:ecs:us-east-1:123456789012:task/c/xyz");
        let mut addrs = BTreeSet::new();
        addrs.insert(Ipv4Addr::new(10, 0, 0, 5));
        let dir = tempfile::tempdir().unwrap();
        let key_pem = initialize_key(dir.path()).unwrap();
        let csr_pem = build_csr(&identity, &addrs, &key_pem).unwrap();

        let authority = SigningAuthority::new_self_signed().unwrap();
        let cert_pem = authority.issue(&csr_pem).unwrap();
        let der = der_from_pem(&cert_pem);

        let result = validate_peer(&der, &other, Ipv4Addr::new(10, 0, 0, 5));
        assert!(matches!(
            result,
            Err(PeerValidationError::CommonNameMismatch { .. })
        ));
    }
}
