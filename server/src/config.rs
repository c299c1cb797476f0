//! # Server Configuration
//!
//! Combines the CLI (dashboard port; tunnel port is derived from it) with
//! the environment: `HTTP_DOMAIN` enables the HTTPS demux, `HTTP_PORT`
//! moves it off 443, and `TLS_CERT_FILE`/`TLS_KEY_FILE` override the
//! wildcard certificate search.

use std::path::PathBuf;

use clap::Parser;

/// Default dashboard/API port. The tunnel control port is always one
/// above it.
pub const DEFAULT_DASHBOARD_PORT: u16 = 8881;
/// Default public HTTPS port for the demux.
pub const DEFAULT_HTTP_PORT: u16 = 443;

/// Certificate locations probed for the demux when no explicit override
/// is configured.
const WILDCARD_CERT_CANDIDATES: &[(&str, &str)] = &[
    ("wildcard.crt", "wildcard.key"),
    ("server.crt", "server.key"),
    ("cert.pem", "key.pem"),
];

#[derive(Debug, Parser)]
#[command(name = "tunnel-server", about = "Reverse tunnel server: TCP, UDP and HTTP tunneling over TLS", version)]
pub struct Cli {
    /// Dashboard/API port (tunnel control port = this + 1).
    #[arg(long, default_value_t = DEFAULT_DASHBOARD_PORT)]
    pub port: u16,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub dashboard_port: u16,
    pub tunnel_port: u16,
    /// Apex domain for HTTP tunneling; `None` disables the demux.
    pub http_domain: Option<String>,
    pub http_port: u16,
    /// Wildcard certificate for the demux, if one could be located.
    pub http_cert: Option<(PathBuf, PathBuf)>,
    /// Host name shown in dashboard snapshots for non-HTTP tunnels.
    pub public_host: String,
}

impl ServerConfig {
    pub fn load(cli: &Cli) -> Self {
        let http_domain = std::env::var("HTTP_DOMAIN")
            .ok()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        let http_port = std::env::var("HTTP_PORT")
            .ok()
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(DEFAULT_HTTP_PORT);

        let public_host = http_domain.clone().unwrap_or_else(|| "localhost".into());

        Self {
            dashboard_port: cli.port,
            tunnel_port: cli.port + 1,
            http_domain,
            http_port,
            http_cert: find_http_cert(),
            public_host,
        }
    }
}

/// Locates the demux certificate: explicit `TLS_CERT_FILE`/`TLS_KEY_FILE`
/// first, then the conventional filenames in the working directory.
fn find_http_cert() -> Option<(PathBuf, PathBuf)> {
    if let (Ok(cert), Ok(key)) = (
        std::env::var("TLS_CERT_FILE"),
        std::env::var("TLS_KEY_FILE"),
    ) {
        let (cert, key) = (PathBuf::from(cert), PathBuf::from(key));
        if cert.exists() && key.exists() {
            return Some((cert, key));
        }
        tracing::warn!(
            "TLS_CERT_FILE/TLS_KEY_FILE set but not readable: {} / {}",
            cert.display(),
            key.display()
        );
    }

    for (cert, key) in WILDCARD_CERT_CANDIDATES {
        let (cert, key) = (PathBuf::from(cert), PathBuf::from(key));
        if cert.exists() && key.exists() {
            return Some((cert, key));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn tunnel_port_is_dashboard_plus_one() {
        let cli = Cli::parse_from(["tunnel-server", "--port", "9000"]);
        let config = ServerConfig::load(&cli);
        assert_eq!(config.dashboard_port, 9000);
        assert_eq!(config.tunnel_port, 9001);
    }

    #[test]
    fn default_ports() {
        let cli = Cli::parse_from(["tunnel-server"]);
        assert_eq!(cli.port, DEFAULT_DASHBOARD_PORT);
    }
}
