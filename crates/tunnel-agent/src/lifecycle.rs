//! Lifecycle controller (§4.8): `Disconnected -> Waking -> WaitingForAddress
//! -> Connecting -> Connected -> (Degraded) -> Disconnected`. Unlike a
//! reconnect loop that only ever dials a statically-known URL, this one
//! first has to wake a cold server and discover its address before a
//! transport dial is even possible.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::ServerName;
use tokio::sync::watch;
use tracing::{info, warn};
use tunnel_cert::{
    discover_public_ip, validate_peer, CertificateManager, HttpMetadataSource, InstanceIdentity,
};
use tunnel_control::{ClusterService, ControlPlaneClient};
use tunnel_mux::{peer_certificate_der, StreamTable, TransportError};

use crate::config::Config;
use crate::inbound::AgentInbound;
use crate::state::{ActiveTunnel, AgentState};

/// How long to wait before re-waking after a failed `wake` or `query`, and
/// between reconnect attempts once the server address is known.
const RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct Lifecycle {
    config: Config,
    state: Arc<AgentState>,
    control: ControlPlaneClient,
    trust_anchor_pem: String,
}

impl Lifecycle {
    pub fn new(config: Config, state: Arc<AgentState>, trust_anchor_pem: String) -> Self {
        let control = ControlPlaneClient::new(
            config.control_base_url.clone(),
            config.control_key_id.clone(),
            config.control_secret.clone(),
        );
        Self {
            config,
            state,
            control,
            trust_anchor_pem,
        }
    }

    /// Runs until `shutdown` reports `true`, waking, connecting, and
    /// reconnecting the tunnel as needed.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let target = ClusterService {
            cluster: self.config.cluster.clone(),
            service: self.config.service.clone(),
        };
        let mut consecutive_failures = 0u32;
        // The server identity/address discovered by the last successful
        // wake+query round. While this is `Some`, a dropped tunnel
        // reconnects straight to it instead of re-waking and re-polling —
        // rediscovery only happens once `max_consecutive_failures` is hit
        // and this is invalidated below (§4.8).
        let mut known_address: Option<(InstanceIdentity, Ipv4Addr)> = None;

        while !*shutdown.borrow() {
            let (identity, server_ip) = match known_address.clone() {
                Some(known) => {
                    info!(server = %known.1, "reconnecting to the already-known server address");
                    known
                }
                None => match self.discover_address(&target, &mut shutdown).await {
                    Some(found) => found,
                    None => continue,
                },
            };

            match self.connect_once(&identity, server_ip, &mut shutdown).await {
                Ok(()) => consecutive_failures = 0,
                Err(e) => {
                    warn!(error = %e, "tunnel transport failed");
                    consecutive_failures += 1;
                }
            }
            known_address = Some((identity, server_ip));

            self.state.clear();
            if *shutdown.borrow() {
                break;
            }

            if consecutive_failures >= self.config.max_consecutive_failures {
                warn!(
                    consecutive_failures,
                    "too many consecutive failures, invalidating cached address"
                );
                consecutive_failures = 0;
                known_address = None;
            } else if sleep_or_shutdown(Duration::from_secs(2), &mut shutdown).await {
                break;
            }
        }

        info!("lifecycle controller stopped");
    }

    /// Wakes the cold server and polls until it reports an address,
    /// returning `None` (after sleeping or checking shutdown as
    /// appropriate) when the caller should just loop around and try again.
    async fn discover_address(
        &self,
        target: &ClusterService,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<(InstanceIdentity, Ipv4Addr)> {
        info!("waking remote server");
        if let Err(e) = self.control.wake(target).await {
            warn!(error = %e, "wake failed, retrying shortly");
            sleep_or_shutdown(RETRY_DELAY, shutdown).await;
            return None;
        }

        info!("polling for server address");
        let (instance_id, public_ip) = match self.control.query_until_ready(target).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "server did not become ready, re-waking");
                return None;
            }
        };

        let server_ip: Ipv4Addr = match public_ip.parse() {
            Ok(ip) => ip,
            Err(e) => {
                warn!(error = %e, ip = %public_ip, "control plane returned an unparseable address");
                return None;
            }
        };
        // Both endpoints' certificates carry the server's own identity
        // as subject common name (§9, Open Question — preserved exactly).
        Some((InstanceIdentity::new(instance_id), server_ip))
    }

    async fn connect_once(
        &self,
        identity: &InstanceIdentity,
        server_ip: Ipv4Addr,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let metadata = HttpMetadataSource::new();
        let own_ip: Ipv4Addr = discover_public_ip(&metadata)
            .await
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        let cert_manager = CertificateManager::new(
            self.config.cache_dir.clone(),
            identity.clone(),
            own_ip,
            self.config.signing_endpoint.clone(),
        );
        let bundle = cert_manager.ensure_for_peer(server_ip).await?;
        let key_pem = std::fs::read_to_string(&bundle.key_path)?;

        let client_config =
            tunnel_mux::build_client_config(&self.trust_anchor_pem, &bundle.cert_pem, &key_pem)?;

        let addr = SocketAddr::from((server_ip, self.config.tunnel_port));
        let server_name = ServerName::IpAddress(rustls_pki_types::IpAddr::from(
            std::net::IpAddr::V4(server_ip),
        ));
        let tls_stream = tunnel_mux::connect(addr, server_name, client_config).await?;

        let (_, connection) = tls_stream.get_ref();
        let peer_certs = connection
            .peer_certificates()
            .ok_or(TransportError::NoPeerCertificate)?;
        let peer_der = peer_certificate_der(peer_certs)?;
        validate_peer(peer_der, identity, server_ip)?;

        info!(server = %server_ip, "mutual tls handshake validated, tunnel connected");

        let table = Arc::new(StreamTable::new());
        let inbound = Arc::new(AgentInbound);
        let (frame_tx, handle) = tunnel_mux::spawn(tls_stream, Arc::clone(&table), inbound);
        self.state.install(ActiveTunnel { frame_tx, table });

        tokio::select! {
            result = handle => {
                match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.into()),
                    Err(e) => Err(anyhow::anyhow!("multiplexer task panicked: {e}")),
                }
            }
            _ = shutdown.changed() => {
                info!("shutdown requested, closing tunnel");
                Ok(())
            }
        }
    }
}

/// Sleeps for `d`, or returns early with `true` if shutdown fires first.
async fn sleep_or_shutdown(d: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => false,
        _ = shutdown.changed() => true,
    }
}
