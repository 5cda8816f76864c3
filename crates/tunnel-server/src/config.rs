//! Server configuration: `clap::Parser` with an environment-variable
//! fallback for every tunable.

use clap::Parser;

/// Remote egress dialer that accepts the mutually-authenticated tunnel and
/// executes HTTP/TCP/WebSocket traffic reaching out from the cloud side.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Port the tunnel transport listens on.
    #[arg(long, env = "TUNNEL_SERVER_LISTEN_PORT", default_value_t = 9443)]
    pub listen_port: u16,

    /// Port the health endpoint listens on.
    #[arg(long, env = "TUNNEL_SERVER_HEALTH_PORT", default_value_t = 9444)]
    pub health_port: u16,

    /// Directory holding the cached private key and certificate.
    #[arg(long, env = "TUNNEL_SERVER_CACHE_DIR", default_value = "/var/lib/tunnel-server")]
    pub cache_dir: String,

    /// Signing authority endpoint for certificate issuance.
    #[arg(long, env = "TUNNEL_SERVER_SIGNING_ENDPOINT")]
    pub signing_endpoint: String,

    /// Trust anchor PEM bundle for the signing authority's CA certificate.
    #[arg(long, env = "TUNNEL_SERVER_TRUST_ANCHOR_PATH")]
    pub trust_anchor_path: String,

    /// Maximum concurrent tunnel connections accepted.
    #[arg(long, env = "TUNNEL_SERVER_MAX_CONNECTIONS", default_value_t = 100)]
    pub max_connections: usize,

    /// Connect timeout for upstream HTTP calls, in seconds.
    #[arg(long, env = "TUNNEL_SERVER_UPSTREAM_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub upstream_connect_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "TUNNEL_SERVER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON.
    #[arg(long, env = "TUNNEL_SERVER_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.signing_endpoint.is_empty() {
            anyhow::bail!("signing endpoint must not be empty");
        }
        if self.trust_anchor_path.is_empty() {
            anyhow::bail!("trust anchor path must not be empty");
        }
        if self.max_connections == 0 {
            anyhow::bail!("max connections must be greater than zero");
        }
        Ok(())
    }
}
