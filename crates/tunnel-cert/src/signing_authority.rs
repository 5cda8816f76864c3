//! Reference implementation of the signing authority's validation and
//! issuance rules from §6.
//!
//! Cloud-specific deployments of the signing authority are out of scope, but
//! the rules themselves — CN shape, address-list requirements,
//! serial/validity/key-usage of the issued cert — carry no cloud dependency,
//! so they live here as a plain library usable by tests and by a minimal
//! reference signer binary. This is not a deployable CA.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use rcgen::{
    CertificateSigningRequestParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose,
    SanType,
};
use rcgen::{CertificateParams, DistinguishedName};

const LEGACY_WELL_KNOWN_CN: &str = "tunnel-legacy";
const CERT_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("csr is not valid PEM/DER: {0}")]
    MalformedCsr(String),
    #[error("csr common name is neither the legacy constant nor ARN-shaped: {0:?}")]
    InvalidCommonName(String),
    #[error("csr carries no IPv4 address")]
    NoAddresses,
    #[error("issuance failed: {0}")]
    Issuance(#[from] rcgen::Error),
}

/// A minimal in-memory certificate authority: an RSA (or any rcgen-
/// supported) key pair plus a self-signed root, used both by tests and by
/// the reference signer.
pub struct SigningAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
}

impl SigningAuthority {
    pub fn new_self_signed() -> Result<Self, SigningError> {
        let ca_key = KeyPair::generate()?;
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "tunnel signing authority");
        params.distinguished_name = dn;
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca_cert = params.self_signed(&ca_key)?;
        Ok(Self { ca_cert, ca_key })
    }

    pub fn trust_anchor_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// `POST {csr}` → `{certificate}` or `{error}` (§6). Validates the CSR
    /// per the rules in §6, then issues a certificate with a random 128-bit
    /// serial, 1-year validity, digital-signature + key-encipherment key
    /// usage, and server-auth + client-auth extended key usage, carrying
    /// exactly the CSR's address list.
    pub fn issue(&self, csr_pem: &str) -> Result<String, SigningError> {
        let csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| SigningError::MalformedCsr(e.to_string()))?;

        let cn = csr
            .params
            .distinguished_name
            .get(&DnType::CommonName)
            .map(dn_value_to_string)
            .unwrap_or_default();
        validate_common_name(&cn)?;

        let addresses: Vec<Ipv4Addr> = csr
            .params
            .subject_alt_names
            .iter()
            .filter_map(|san| match san {
                SanType::IpAddress(IpAddr::V4(ip)) => Some(*ip),
                _ => None,
            })
            .collect();
        if addresses.is_empty() {
            return Err(SigningError::NoAddresses);
        }

        let mut issued_params = csr.params.clone();
        issued_params.serial_number = Some(random_serial());
        issued_params.not_before = time::OffsetDateTime::now_utc();
        issued_params.not_after = issued_params.not_before + CERT_VALIDITY;
        issued_params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        issued_params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let cert = issued_params.signed_by(&csr.public_key, &self.ca_cert, &self.ca_key)?;
        Ok(cert.pem())
    }
}

fn dn_value_to_string(v: &rcgen::DnValue) -> String {
    match v {
        rcgen::DnValue::Utf8String(s) => s.clone(),
        rcgen::DnValue::Ia5String(s) => s.to_string(),
        rcgen::DnValue::PrintableString(s) => s.to_string(),
        rcgen::DnValue::TeletexString(s) => s.to_string(),
        _ => String::new(),
    }
}

fn validate_common_name(cn: &str) -> Result<(), SigningError> {
    if cn == LEGACY_WELL_KNOWN_CN || is_arn_shaped(cn) {
        Ok(())
    } else {
        Err(SigningError::InvalidCommonName(cn.to_string()))
    }
}

/// Recognizes the coarse shape of a cloud-platform task/instance ARN:
/// `service:region:account:resource-type/id` after an `arn:` prefix. Exact
/// validation is the issuing platform's concern; this only rejects obvious
/// garbage.
fn is_arn_shaped(cn: &str) -> bool {
    cn.starts_with("arn:") && cn.splitn(6, ':').count() >= 6
}

fn random_serial() -> rcgen::SerialNumber {
    let bytes: [u8; 16] = rand::random();
    rcgen::SerialNumber::from_slice(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::build_csr;
    use crate::identity::InstanceIdentity;
    use crate::key::initialize_key;
    use std::collections::BTreeSet;

    fn sample_csr() -> (String, String) {
        let dir = tempfile::tempdir().unwrap();
        let key_pem = initialize_key(dir.path()).unwrap();
        let identity = InstanceIdentity::new("arn:aws:ecs:us-east-1:123456789012:task/c/abc");
        let mut addrs = BTreeSet::new();
        addrs.insert(Ipv4Addr::new(54, 1, 2, 3));
        (build_csr(&identity, &addrs, &key_pem).unwrap(), key_pem)
    }

    #[test]
    fn issues_a_certificate_for_an_arn_shaped_common_name() {
        let (csr_pem, _key) = sample_csr();
        let authority = SigningAuthority::new_self_signed().unwrap();
        let cert_pem = authority.issue(&csr_pem).unwrap();
        assert!(cert_pem.contains("CERTIFICATE"));
    }

    #[test]
    fn rejects_a_csr_with_no_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let key_pem = initialize_key(dir.path()).unwrap();
        let identity = InstanceIdentity::new("arn:aws:ecs:us-east-1:123456789012:task/c/abc");
        let csr_pem = build_csr(&identity, &BTreeSet::new(), &key_pem).unwrap();

        let authority = SigningAuthority::new_self_signed().unwrap();
        assert!(matches!(
            authority.issue(&csr_pem),
            Err(SigningError::NoAddresses)
        ));
    }

    #[test]
    fn rejects_a_common_name_that_is_neither_legacy_nor_arn_shaped() {
        let dir = tempfile::tempdir().unwrap();
        let key_pem = initialize_key(dir.path()).unwrap();
        let identity = InstanceIdentity::new("not-an-arn");
        let mut addrs = BTreeSet::new();
        addrs.insert(Ipv4Addr::new(10, 0, 0, 1));
        let csr_pem = build_csr(&identity, &addrs, &key_pem).unwrap();

        let authority = SigningAuthority::new_self_signed().unwrap();
        assert!(matches!(
            authority.issue(&csr_pem),
            Err(SigningError::InvalidCommonName(_))
        ));
    }
}
