//! `GET /health` on a separate port (§6): liveness plus connection/capacity
//! accounting for the operator's health checks.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use crate::state::ServerState;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    active_connections: usize,
    uptime_seconds: u64,
    max_connections: usize,
    connections_percent: f64,
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthBody> {
    let active = state.active_connections();
    let max = state.max_connections;
    Json(HealthBody {
        status: "ok",
        active_connections: active,
        uptime_seconds: state.uptime().as_secs(),
        max_connections: max,
        connections_percent: if max == 0 { 0.0 } else { (active as f64 / max as f64) * 100.0 },
    })
}

pub async fn run(port: u16, state: Arc<ServerState>) -> anyhow::Result<()> {
    let app = Router::new().route("/health", get(health)).with_state(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}
