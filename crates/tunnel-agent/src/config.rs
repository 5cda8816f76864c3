//! Agent configuration: `clap::Parser` with an environment-variable fallback
//! for every tunable.

use clap::Parser;

/// Local HTTP/HTTPS/WebSocket proxy that wakes and multiplexes onto a
/// remote egress tunnel server.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Port the local proxy listens on.
    #[arg(long, env = "TUNNEL_AGENT_LISTEN_PORT", default_value_t = 8080)]
    pub listen_port: u16,

    /// Port the health endpoint listens on.
    #[arg(long, env = "TUNNEL_AGENT_HEALTH_PORT", default_value_t = 8081)]
    pub health_port: u16,

    /// Directory holding the cached private key and certificate.
    #[arg(long, env = "TUNNEL_AGENT_CACHE_DIR", default_value = "/var/lib/tunnel-agent")]
    pub cache_dir: String,

    /// Signing authority endpoint for certificate issuance.
    #[arg(long, env = "TUNNEL_AGENT_SIGNING_ENDPOINT")]
    pub signing_endpoint: String,

    /// Trust anchor PEM bundle for the signing authority's CA certificate.
    #[arg(long, env = "TUNNEL_AGENT_TRUST_ANCHOR_PATH")]
    pub trust_anchor_path: String,

    /// Control-plane base URL for wake/query/kill.
    #[arg(long, env = "TUNNEL_AGENT_CONTROL_BASE_URL")]
    pub control_base_url: String,

    /// Control-plane request-signing key id.
    #[arg(long, env = "TUNNEL_AGENT_CONTROL_KEY_ID")]
    pub control_key_id: String,

    /// Control-plane request-signing shared secret.
    #[arg(long, env = "TUNNEL_AGENT_CONTROL_SECRET")]
    pub control_secret: String,

    /// Cluster name passed to wake/query/kill.
    #[arg(long, env = "TUNNEL_AGENT_CLUSTER")]
    pub cluster: String,

    /// Service name passed to wake/query/kill.
    #[arg(long, env = "TUNNEL_AGENT_SERVICE")]
    pub service: String,

    /// Tunnel transport port on the remote server.
    #[arg(long, env = "TUNNEL_AGENT_TUNNEL_PORT", default_value_t = 9443)]
    pub tunnel_port: u16,

    /// Consecutive transport failures before invalidating the cached server
    /// address and re-entering the Waking state (§4.8).
    #[arg(long, env = "TUNNEL_AGENT_MAX_CONSECUTIVE_FAILURES", default_value_t = 3)]
    pub max_consecutive_failures: u32,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "TUNNEL_AGENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON.
    #[arg(long, env = "TUNNEL_AGENT_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.signing_endpoint.is_empty() {
            anyhow::bail!("signing endpoint must not be empty");
        }
        if self.control_base_url.is_empty() {
            anyhow::bail!("control-plane base url must not be empty");
        }
        if self.cluster.is_empty() || self.service.is_empty() {
            anyhow::bail!("cluster and service must both be set");
        }
        Ok(())
    }
}
