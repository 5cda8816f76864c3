//! Composes the certificate signing request described in §4.3/§6: common
//! name is this endpoint's instance identity, and the address list is the
//! union of the endpoint's own public IP, every peer IP seen so far, and
//! the IP currently being authorized.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};

use crate::identity::InstanceIdentity;

#[derive(Debug, thiserror::Error)]
pub enum CsrError {
    #[error("rcgen error: {0}")]
    Rcgen(#[from] rcgen::Error),
    #[error("key material is not a valid PEM key pair: {0}")]
    KeyPair(String),
}

/// Build a PEM-encoded CSR whose CN is `identity` and whose IPv4 address
/// list is `addresses`, signed by `key_pem` (the PKCS#8 PEM produced by
/// [`crate::key::initialize_key`]).
pub fn build_csr(
    identity: &InstanceIdentity,
    addresses: &BTreeSet<Ipv4Addr>,
    key_pem: &str,
) -> Result<String, CsrError> {
    let key_pair = KeyPair::from_pem(key_pem).map_err(|e| CsrError::KeyPair(e.to_string()))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, identity.as_str());
    params.distinguished_name = dn;
    params.subject_alt_names = addresses
        .iter()
        .copied()
        .map(|ip| SanType::IpAddress(ip.into()))
        .collect();

    let csr = params.serialize_request(&key_pair)?;
    Ok(csr.pem()?)
}
