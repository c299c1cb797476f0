//! # Tunnel Client
//!
//! Exposes a local TCP, UDP or HTTP backend through a tunnel server.
//! One TLS control channel carries session setup and keepalive; payload
//! flows over dial-back TCP streams, encrypted UDP datagrams, or inlined
//! HTTP exchanges.
//!
//! ## Modules
//!
//! - [`state`]   — client identity and per-connection state
//! - [`control`] — control channel: registration, heartbeat, dispatch
//! - [`proxy`]   — TCP back-channel handling
//! - [`udp`]     — UDP datapath and flow management
//! - [`http`]    — local HTTP forwarding
//! - [`tls`]     — connector with pinning or self-signed acceptance
//! - [`stats`]   — traffic counters and the status line

mod control;
mod http;
mod proxy;
mod state;
mod stats;
mod tls;
mod udp;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use crate::state::{Client, ClientConfig};

/// First reconnect delay; doubles up to [`MAX_BACKOFF`] and resets on a
/// successful registration.
const INITIAL_BACKOFF: Duration = Duration::from_secs(3);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Parser)]
#[command(
    name = "tunnel-client",
    about = "Expose a local TCP, UDP or HTTP backend through a tunnel server",
    version
)]
struct Cli {
    /// Tunnel server address (host:port).
    #[arg(long, default_value = "127.0.0.1:8882")]
    server: String,

    /// Local host to tunnel.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Local port (overridden by the positional argument).
    #[arg(long, default_value_t = 80)]
    port: u16,

    /// Client ID. Defaults to a generated name.
    #[arg(long)]
    id: Option<String>,

    /// Protocol: tcp, udp or http.
    #[arg(long, default_value = "tcp")]
    proto: String,

    /// Periodic status output (--ui false to disable).
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    ui: bool,

    /// Server certificate SHA-256 fingerprint for pinning (hex).
    #[arg(long = "cert-pin")]
    cert_pin: Option<String>,

    /// `[LOCAL_PORT]` or `[HOST LOCAL_PORT]`.
    #[arg(value_name = "TARGET", num_args = 0..=2)]
    target: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_client=info".into()),
        )
        .init();

    // reqwest pulls in a second rustls provider; pick ring explicitly so
    // config builders stay unambiguous.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let client = Arc::new(Client::new(config)?);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
        result = run(client) => result,
    }
}

/// The reconnect loop: each attempt runs one control connection; backoff
/// doubles on failure and resets once a registration succeeds.
async fn run(client: Arc<Client>) -> anyhow::Result<()> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if let Err(e) = control::run_once(client.clone()).await {
            warn!("control connection failed: {}", e);
        }
        if client.take_registered() {
            backoff = INITIAL_BACKOFF;
        }
        info!("reconnecting in {:?}", backoff);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Resolves the CLI into a [`ClientConfig`], positionals winning over
/// flags for the target address.
fn resolve_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut host = cli.host.trim().to_string();
    if host.is_empty() {
        host = "localhost".into();
    }
    let mut port = cli.port;

    match cli.target.as_slice() {
        [] => {}
        [p] => port = parse_port(p)?,
        [h, p, ..] => {
            if !h.trim().is_empty() {
                host = h.trim().to_string();
            }
            port = parse_port(p)?;
        }
    }
    anyhow::ensure!(port != 0, "invalid local port: 0");

    let protocol = match cli.proto.trim().to_ascii_lowercase().as_str() {
        "udp" => "udp",
        "http" => "http",
        _ => "tcp",
    }
    .to_string();

    let client_id = match cli.id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => match std::env::var("HOSTNAME").ok().filter(|h| !h.trim().is_empty()) {
            Some(hostname) => format!("client-{}", hostname.trim()),
            None => format!("client-{}", &tunnel_protocol::ids::generate_id()[..8]),
        },
    };

    let local_is_loopback = matches!(host.as_str(), "localhost" | "::1") || host.starts_with("127.");

    Ok(ClientConfig {
        server_addr: cli.server.trim().to_string(),
        local_addr: format!("{}:{}", host, port),
        local_is_loopback,
        client_id,
        protocol,
        cert_pin: cli
            .cert_pin
            .as_deref()
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty()),
        ui: cli.ui,
    })
}

fn parse_port(text: &str) -> anyhow::Result<u16> {
    let port: u16 = text
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid local port: {:?}", text))?;
    anyhow::ensure!(port != 0, "invalid local port: {:?}", text);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ClientConfig {
        let mut argv = vec!["tunnel-client"];
        argv.extend_from_slice(args);
        resolve_config(&Cli::parse_from(argv)).unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.local_addr, "localhost:80");
        assert_eq!(config.protocol, "tcp");
        assert!(config.local_is_loopback);
        assert!(config.ui);
    }

    #[test]
    fn positional_port_wins() {
        let config = parse(&["--port", "90", "3000"]);
        assert_eq!(config.local_addr, "localhost:3000");
    }

    #[test]
    fn positional_host_and_port() {
        let config = parse(&["192.168.1.5", "8080"]);
        assert_eq!(config.local_addr, "192.168.1.5:8080");
        assert!(!config.local_is_loopback);
    }

    #[test]
    fn unknown_protocol_falls_back_to_tcp() {
        let config = parse(&["--proto", "quic"]);
        assert_eq!(config.protocol, "tcp");
    }

    #[test]
    fn bad_port_is_fatal() {
        let cli = Cli::parse_from(["tunnel-client", "notaport"]);
        assert!(resolve_config(&cli).is_err());
    }
}
