//! Mutual TLS 1.3 setup and connection establishment (§4.4). Generalizes
//! `tunnel::client::build_tls_config`, which only trusts a root store for a
//! one-way TLS client connection, into a two-way setup where both sides
//! present a certificate and both verify the peer's chain against the
//! tunnel's own signing authority rather than a public root store.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no certificate found in PEM")]
    NoCertificate,
    #[error("no private key found in PEM")]
    NoPrivateKey,
    #[error("malformed PEM: {0}")]
    MalformedPem(std::io::Error),
    #[error("tls configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("client verifier construction failed: {0}")]
    ClientVerifier(#[from] rustls::server::VerifierBuilderError),
    #[error("tcp connect failed: {0}")]
    Connect(std::io::Error),
    #[error("tls handshake failed: {0}")]
    Handshake(std::io::Error),
    #[error("peer presented no certificate")]
    NoPeerCertificate,
}

fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut pem.as_bytes()).collect();
    let certs = certs.map_err(TransportError::MalformedPem)?;
    if certs.is_empty() {
        return Err(TransportError::NoCertificate);
    }
    Ok(certs)
}

fn load_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(TransportError::MalformedPem)?
        .ok_or(TransportError::NoPrivateKey)
}

fn trust_store(trust_anchor_pem: &str) -> Result<rustls::RootCertStore, TransportError> {
    let mut store = rustls::RootCertStore::empty();
    for cert in load_certs(trust_anchor_pem)? {
        let _ = store.add(cert);
    }
    Ok(store)
}

/// Builds the agent's (or server's) outbound TLS client configuration:
/// trusts only the tunnel's own signing authority, and presents this
/// endpoint's own certificate and key for mutual authentication.
pub fn build_client_config(
    trust_anchor_pem: &str,
    cert_pem: &str,
    key_pem: &str,
) -> Result<Arc<rustls::ClientConfig>, TransportError> {
    let roots = trust_store(trust_anchor_pem)?;
    let certs = load_certs(cert_pem)?;
    let key = load_private_key(key_pem)?;
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Builds the server's inbound TLS configuration: requires and verifies a
/// client certificate against the same trust anchor.
pub fn build_server_config(
    trust_anchor_pem: &str,
    cert_pem: &str,
    key_pem: &str,
) -> Result<Arc<rustls::ServerConfig>, TransportError> {
    let roots = Arc::new(trust_store(trust_anchor_pem)?);
    let certs = load_certs(cert_pem)?;
    let key = load_private_key(key_pem)?;
    let client_verifier = rustls::server::WebPkiClientVerifier::builder(roots).build()?;
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

pub type ClientTlsStream = tokio_rustls::client::TlsStream<TcpStream>;
pub type ServerTlsStream = tokio_rustls::server::TlsStream<TcpStream>;

/// Dials `addr` over TCP and performs the TLS client handshake, presenting
/// `server_name` (ordinarily the server's own public IP — the certificate
/// asserts addresses, not DNS names) for chain validation.
pub async fn connect(
    addr: SocketAddr,
    server_name: ServerName<'static>,
    config: Arc<rustls::ClientConfig>,
) -> Result<ClientTlsStream, TransportError> {
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(TransportError::Connect)?;
    tcp.set_nodelay(true).ok();
    let connector = TlsConnector::from(config);
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(TransportError::Handshake)?;
    debug!(%addr, "mutual tls handshake complete (client)");
    Ok(tls)
}

/// Completes the TLS server handshake on an already-accepted TCP
/// connection.
pub async fn accept(
    tcp: TcpStream,
    config: Arc<rustls::ServerConfig>,
) -> Result<ServerTlsStream, TransportError> {
    let acceptor = TlsAcceptor::from(config);
    let tls = acceptor.accept(tcp).await.map_err(TransportError::Handshake)?;
    debug!("mutual tls handshake complete (server)");
    Ok(tls)
}

pub fn peer_certificate_der<'a>(
    certs: &'a [CertificateDer<'static>],
) -> Result<&'a [u8], TransportError> {
    certs.first().map(|c| c.as_ref()).ok_or(TransportError::NoPeerCertificate)
}
