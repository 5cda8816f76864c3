//! Identity discovery, lazy RSA/TLS certificate provisioning, and peer
//! certificate validation for both tunnel endpoints (§4.2, §4.3).

mod csr;
mod identity;
mod key;
mod manager;
mod retry;
mod signing_authority;
mod signing_client;

pub use csr::{build_csr, CsrError};
pub use identity::{
    discover_instance_id, discover_public_ip, HttpMetadataSource, InstanceIdentity,
    MetadataSource, NotAvailable,
};
pub use key::{initialize_key, KeyError};
pub use manager::{validate_peer, CertBundle, CertManagerError, CertificateManager, PeerValidationError};
pub use retry::{Backoff, CircuitBreaker, CircuitBreakerError, CircuitOpenError};
pub use signing_authority::{SigningAuthority, SigningError};
pub use signing_client::{SigningClient, SigningClientError};
