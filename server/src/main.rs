//! # Tunnel Server
//!
//! A reverse-tunneling server that exposes clients' local TCP, UDP or
//! HTTP backends on public ports and subdomains. Clients keep one
//! long-lived TLS control channel; payload travels on dial-back TCP
//! streams, an encrypted UDP datapath, or inlined HTTP exchanges.
//!
//! ## Modules
//!
//! - [`config`]    — CLI flags and environment
//! - [`state`]     — the shared `Core` aggregate and session type
//! - [`control`]   — TLS accept loop, registration, control dispatch
//! - [`ports`]     — public port pool with sticky reservations
//! - [`ratelimit`] — per-source token buckets
//! - [`proxy`]     — TCP dial-back proxy path
//! - [`udp`]       — encrypted UDP datapath
//! - [`http`]      — HTTPS-to-tunnel demultiplexer
//! - [`api`]       — read-only dashboard snapshot endpoints
//! - [`tls`]       — tunnel TLS identity

mod api;
mod config;
mod control;
mod http;
mod ports;
mod proxy;
mod ratelimit;
mod state;
mod tls;
mod udp;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use crate::config::{Cli, ServerConfig};
use crate::state::Core;

/// Bound on concurrently handled control connections.
const MAX_CONNECTIONS: usize = 10_000;
/// How often expired port reservations are swept.
const RESERVATION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Structured logging with env-filter support; override with RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_server=info".into()),
        )
        .init();

    // Several dependencies link rustls; pin the process-wide provider so
    // config builders stay unambiguous.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();
    let config = ServerConfig::load(&cli);
    info!(
        "starting: dashboard port {}, tunnel port {}",
        config.dashboard_port, config.tunnel_port
    );

    // The UDP datapath shares the tunnel port number. A failed bind
    // degrades UDP tunneling only.
    let udp_socket = match UdpSocket::bind(("0.0.0.0", config.tunnel_port)).await {
        Ok(socket) => Some(Arc::new(socket)),
        Err(e) => {
            warn!("failed to bind udp port {}: {}", config.tunnel_port, e);
            None
        }
    };

    let core = Arc::new(Core::new(config, udp_socket, MAX_CONNECTIONS));

    // The tunnel TLS identity is required; generation failure is fatal.
    let acceptor = tls::tunnel_acceptor()?;

    spawn_sweepers(core.clone());
    tokio::spawn(udp::run_udp_server(core.clone()));

    {
        let core = core.clone();
        tokio::spawn(async move {
            if let Err(e) = api::run_dashboard_api(core).await {
                error!("dashboard api failed: {}", e);
            }
        });
    }

    if core.http_enabled() {
        let core = core.clone();
        tokio::spawn(async move {
            if let Err(e) = http::run_http_proxy(core).await {
                error!("https proxy failed: {}", e);
            }
        });
    } else {
        info!("HTTP_DOMAIN not set; http tunneling disabled");
    }

    control::run_tunnel_listener(core, acceptor).await
}

/// Periodic maintenance: expired port reservations and stale rate-bucket
/// records.
fn spawn_sweepers(core: Arc<Core>) {
    {
        let core = core.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RESERVATION_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let evicted = core.ports.lock().await.sweep_reservations();
                if evicted > 0 {
                    info!("expired {} port reservation(s)", evicted);
                }
            }
        });
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(crate::ratelimit::GC_INTERVAL);
        loop {
            ticker.tick().await;
            core.rate_limits.sweep();
        }
    });
}
