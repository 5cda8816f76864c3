//! Tunnel transport listener (§4.9): accept loop with a semaphore-bounded
//! connection cap. Each accepted agent gets its own certificate lazily
//! extended to cover its address (§4.3), a fresh mutual-TLS handshake, and
//! its own multiplexer instance.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};
use tunnel_cert::{validate_peer, CertificateManager, InstanceIdentity};
use tunnel_mux::{peer_certificate_der, StreamTable, TransportError};

use crate::inbound::ServerInbound;
use crate::state::ServerState;

pub async fn run(
    listen_port: u16,
    max_connections: usize,
    trust_anchor_pem: Arc<String>,
    identity: InstanceIdentity,
    cert_manager: Arc<CertificateManager>,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], listen_port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "tunnel transport listening");

    let semaphore = Arc::new(Semaphore::new(max_connections));

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (tcp, peer_addr) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to accept tunnel connection");
                        continue;
                    }
                };

                let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(peer = %peer_addr, "tunnel connection rejected: capacity reached");
                        continue;
                    }
                };

                let trust_anchor_pem = Arc::clone(&trust_anchor_pem);
                let identity = identity.clone();
                let cert_manager = Arc::clone(&cert_manager);
                let state = Arc::clone(&state);

                state.connection_opened();
                tokio::task::spawn(async move {
                    let _permit = permit;
                    handle_connection(tcp, peer_addr, &trust_anchor_pem, &identity, &cert_manager, Arc::clone(&state)).await;
                    state.connection_closed();
                });
            }
            _ = shutdown_rx.changed() => {
                info!("tunnel transport shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    tcp: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    trust_anchor_pem: &str,
    identity: &InstanceIdentity,
    cert_manager: &CertificateManager,
    state: Arc<ServerState>,
) {
    let IpAddr::V4(peer_ip) = peer_addr.ip() else {
        warn!(peer = %peer_addr, "rejecting non-IPv4 tunnel peer");
        return;
    };

    let bundle = match cert_manager.ensure_for_peer(peer_ip).await {
        Ok(bundle) => bundle,
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "cannot provision certificate for this peer");
            return;
        }
    };
    let key_pem = match std::fs::read_to_string(&bundle.key_path) {
        Ok(k) => k,
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "failed to read cached private key");
            return;
        }
    };
    let server_config = match tunnel_mux::build_server_config(trust_anchor_pem, &bundle.cert_pem, &key_pem) {
        Ok(c) => c,
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "failed to build tls server config");
            return;
        }
    };

    let tls_stream = match tunnel_mux::accept(tcp, server_config).await {
        Ok(s) => s,
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "mutual tls handshake failed");
            return;
        }
    };

    let (_, connection) = tls_stream.get_ref();
    let peer_certs = match connection.peer_certificates() {
        Some(certs) => certs,
        None => {
            warn!(peer = %peer_addr, "peer presented no certificate");
            return;
        }
    };
    let peer_der = match peer_certificate_der(peer_certs) {
        Ok(der) => der,
        Err(TransportError::NoPeerCertificate) => {
            warn!(peer = %peer_addr, "peer presented no certificate");
            return;
        }
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "failed to read peer certificate");
            return;
        }
    };
    if let Err(e) = validate_peer(peer_der, identity, peer_ip) {
        warn!(peer = %peer_addr, error = %e, "peer certificate validation failed");
        return;
    }

    debug!(peer = %peer_addr, "mutual tls handshake validated, tunnel connected");

    let table = Arc::new(StreamTable::new());
    let inbound = Arc::new(ServerInbound::new(Arc::clone(&state), Arc::clone(&table)));
    let (_frame_tx, handle) = tunnel_mux::spawn(tls_stream, table, inbound);

    match handle.await {
        Ok(Ok(())) => debug!(peer = %peer_addr, "tunnel closed cleanly"),
        Ok(Err(e)) => warn!(peer = %peer_addr, error = %e, "tunnel transport failed"),
        Err(e) => warn!(peer = %peer_addr, error = %e, "multiplexer task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mirrors the accept loop's `try_acquire_owned` call against the same
    /// cap (§5: "bounded global counter caps concurrent inbound transport
    /// connections") without needing a live TLS handshake for every permit.
    #[test]
    fn the_101st_connection_is_rejected_when_the_cap_is_100() {
        let semaphore = Arc::new(Semaphore::new(100));
        let mut permits = Vec::new();
        for _ in 0..100 {
            permits.push(Arc::clone(&semaphore).try_acquire_owned().unwrap());
        }

        assert!(Arc::clone(&semaphore).try_acquire_owned().is_err());

        drop(permits.pop());
        assert!(Arc::clone(&semaphore).try_acquire_owned().is_ok());
    }
}
