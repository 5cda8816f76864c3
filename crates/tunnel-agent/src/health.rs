//! `GET /health` liveness and tunnel-connected state (§6).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use crate::state::AgentState;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    tunnel_connected: bool,
}

async fn health(State(state): State<Arc<AgentState>>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        tunnel_connected: state.is_connected(),
    })
}

pub async fn run(port: u16, state: Arc<AgentState>) -> anyhow::Result<()> {
    let app = Router::new().route("/health", get(health)).with_state(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}
