//! Local proxy listener (§4.7): plain HTTP only, one port, dispatching
//! `CONNECT` / WebSocket-upgrade / plain requests to their handlers. A
//! single accept loop feeding a per-connection `service_fn`; no TLS peek
//! here since the agent's local listener is never TLS — only the
//! agent-to-server tunnel transport is.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::proxy::{connect, http, websocket, ResponseBody};
use crate::state::AgentState;

pub async fn run(
    listen_port: u16,
    state: Arc<AgentState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], listen_port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "proxy listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
                }

                let state = Arc::clone(&state);
                tokio::task::spawn(async move {
                    serve_connection(TokioIo::new(stream), peer_addr, state).await;
                });
            }
            _ = shutdown_rx.changed() => {
                info!("proxy listener shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn serve_connection(io: TokioIo<tokio::net::TcpStream>, peer_addr: SocketAddr, state: Arc<AgentState>) {
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, std::convert::Infallible>(dispatch(req, state).await) }
    });

    if let Err(e) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(false)
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        if !e.to_string().contains("connection closed") {
            debug!(peer = %peer_addr, error = %e, "connection error");
        }
    }
}

async fn dispatch(req: Request<Incoming>, state: Arc<AgentState>) -> Response<ResponseBody> {
    if req.method() == Method::CONNECT {
        connect::handle(req, state).await
    } else if websocket::is_upgrade_request(&req) {
        websocket::handle(req, state).await
    } else {
        http::handle(req, state).await
    }
}
