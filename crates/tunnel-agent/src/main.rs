mod config;
mod health;
mod inbound;
mod lifecycle;
mod proxy;
mod state;

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use config::Config;
use lifecycle::Lifecycle;
use state::AgentState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config = Config::parse();
    config.validate()?;
    init_tracing(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "tunnel-agent starting");

    let trust_anchor_pem = std::fs::read_to_string(&config.trust_anchor_path)
        .map_err(|e| anyhow::anyhow!("failed to read trust anchor at {}: {e}", config.trust_anchor_path))?;

    let state = Arc::new(AgentState::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let lifecycle = Lifecycle::new(config.clone(), Arc::clone(&state), trust_anchor_pem);
    let lifecycle_handle = tokio::spawn(lifecycle.run(shutdown_rx.clone()));

    let health_handle = tokio::spawn(health::run(config.health_port, Arc::clone(&state)));

    let proxy_handle = tokio::spawn(proxy::server::run(config.listen_port, state, shutdown_rx));

    wait_for_shutdown().await;
    info!("shutdown signal received, cleaning up");
    let _ = shutdown_tx.send(true);

    let _ = lifecycle_handle.await;
    health_handle.abort();
    let _ = proxy_handle.await;

    info!("tunnel-agent stopped");
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
