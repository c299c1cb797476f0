//! # Dashboard Snapshot API
//!
//! The read-only REST surface consumed by the external dashboard:
//! a health probe, the list of active tunnels and aggregate counters.
//! Everything else the dashboard does (persistence, auth, push updates)
//! lives outside this server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::state::{Core, SessionSnapshot};

/// `GET /health` — liveness probe.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "server": "tunnel-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Serialize)]
struct TunnelList {
    success: bool,
    data: Vec<SessionSnapshot>,
}

/// `GET /api/v1/tunnels` — all active sessions.
async fn list_tunnels(State(core): State<Arc<Core>>) -> Json<TunnelList> {
    let (tunnels, _, _) = core.snapshot();
    Json(TunnelList {
        success: true,
        data: tunnels,
    })
}

/// `GET /api/v1/metrics` — aggregate counters.
async fn metrics(State(core): State<Arc<Core>>) -> Json<serde_json::Value> {
    let (tunnels, total_up, total_down) = core.snapshot();
    let total_connections: u64 = tunnels.iter().map(|t| t.total_connections).sum();
    Json(json!({
        "success": true,
        "data": {
            "active_tunnels": tunnels.len(),
            "total_connections": total_connections,
            "total_bytes_up": total_up,
            "total_bytes_down": total_down,
        }
    }))
}

/// Serves the dashboard API on the configured port until the process
/// exits.
pub async fn run_dashboard_api(core: Arc<Core>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], core.config.dashboard_port));

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/v1/tunnels", get(list_tunnels))
        .route("/api/v1/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .with_state(core);

    info!("dashboard api listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
