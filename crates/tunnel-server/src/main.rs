mod config;
mod dispatcher;
mod health;
mod inbound;
mod state;
mod supervision;
mod tcp_dial;
mod ws_dial;

use std::net::Ipv4Addr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tunnel_cert::{discover_instance_id, discover_public_ip, CertificateManager, HttpMetadataSource};

use config::Config;
use state::ServerState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config = Config::parse();
    config.validate()?;
    init_tracing(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "tunnel-server starting");

    let trust_anchor_pem = Arc::new(std::fs::read_to_string(&config.trust_anchor_path).map_err(|e| {
        anyhow::anyhow!("failed to read trust anchor at {}: {e}", config.trust_anchor_path)
    })?);

    let metadata = HttpMetadataSource::new();
    let identity = discover_instance_id(&metadata)
        .await
        .map_err(|_| anyhow::anyhow!("failed to discover this instance's identity"))?;
    let own_ip: Ipv4Addr = discover_public_ip(&metadata)
        .await
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Ipv4Addr::UNSPECIFIED);

    info!(identity = %identity, address = %own_ip, "resolved instance identity");

    let cert_manager = Arc::new(CertificateManager::new(
        config.cache_dir.clone(),
        identity.clone(),
        own_ip,
        config.signing_endpoint.clone(),
    ));

    let reqwest_client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(config.upstream_connect_timeout_secs))
        .build()
        .expect("failed to build reqwest client");
    let state = Arc::new(ServerState::new(reqwest_client, config.max_connections));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health_handle = tokio::spawn(health::run(config.health_port, Arc::clone(&state)));

    let supervision_handle = tokio::spawn(supervision::run(
        config.listen_port,
        config.max_connections,
        trust_anchor_pem,
        identity,
        cert_manager,
        state,
        shutdown_rx,
    ));

    wait_for_shutdown().await;
    info!("shutdown signal received, cleaning up");
    let _ = shutdown_tx.send(true);

    health_handle.abort();
    let _ = supervision_handle.await;

    info!("tunnel-server stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
