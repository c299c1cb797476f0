//! # Control-Channel Loop (client)
//!
//! Manages one control connection to the tunnel server:
//! - TLS connect and registration (reusing the previous key and public
//!   port on reconnect)
//! - Heartbeat pings and RTT measurement
//! - Incoming message dispatch to the proxy, UDP and HTTP handlers
//! - Clean state reset on disconnect
//!
//! The reconnect policy lives in `main`; this module runs exactly one
//! connection to completion.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use tunnel_protocol::codec::{FrameReader, FrameWriter};
use tunnel_protocol::message::ControlMessage;

use crate::state::{Client, Connection, ServerStream};
use crate::{http, proxy, stats, udp};

/// Interval between client pings.
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Runs one control connection until it fails or disconnects.
pub async fn run_once(client: Arc<Client>) -> anyhow::Result<()> {
    info!("connecting to server {}", client.config.server_addr);
    let stream = TcpStream::connect(&client.config.server_addr)
        .await
        .context("failed to reach server")?;
    let _ = stream.set_nodelay(true);

    let name = crate::tls::server_name(&client.config.server_addr)?;
    let tls: ServerStream = client
        .connector
        .connect(name, stream)
        .await
        .context("tls handshake failed")?;

    let (read_half, write_half) = tokio::io::split(tls);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    // Register, reusing the previous identity for sticky reconnects.
    let register = ControlMessage::Register {
        key: client.key(),
        client_id: Some(client.config.client_id.clone()),
        target: Some(client.config.local_addr.clone()),
        protocol: Some(client.config.protocol.clone()),
        requested_port: client.remote_port(),
    };
    writer.write_frame(&register).await?;

    let reply = reader
        .read_frame()
        .await?
        .context("server closed during registration")?;
    let (key, remote_port, protocol) = match reply {
        ControlMessage::Registered {
            key,
            remote_port,
            protocol,
            subdomain,
            base_domain,
            udp_secret,
            ..
        } => {
            let secret = udp_secret.as_deref().and_then(decode_secret);
            client.store_registration(
                key.clone(),
                remote_port,
                subdomain,
                base_domain,
                secret,
            );
            (key, remote_port, protocol)
        }
        ControlMessage::Error { error } => {
            anyhow::bail!("registration rejected: {}", error)
        }
        other => anyhow::bail!("unexpected registration reply: {:?}", other),
    };
    debug_assert!(!key.is_empty());

    if protocol == "http" {
        match client.public_endpoint() {
            Some(url) => info!("http tunnel active: {} -> {}", url, client.config.local_addr),
            None => info!("http tunnel active -> {}", client.config.local_addr),
        }
    } else {
        info!(
            "registered, public port {} ({} -> {})",
            remote_port, protocol, client.config.local_addr
        );
    }

    let conn = Arc::new(Connection::new(client.clone(), writer));

    if client.config.protocol == "udp" {
        if let Err(e) = udp::setup_channel(conn.clone()).await {
            warn!("udp channel setup failed: {}", e);
        }
    }

    let heartbeat = tokio::spawn(heartbeat_loop(conn.clone()));
    let status = client
        .config
        .ui
        .then(|| tokio::spawn(stats::status_loop(conn.clone())));

    let result = receive_loop(&conn, reader).await;

    conn.close();
    heartbeat.abort();
    if let Some(status) = status {
        status.abort();
    }
    warn!("disconnected from server");
    result
}

/// Reads and dispatches control frames until EOF or error.
async fn receive_loop(
    conn: &Arc<Connection>,
    mut reader: FrameReader<tokio::io::ReadHalf<ServerStream>>,
) -> anyhow::Result<()> {
    // Pinned once so a shutdown fired between iterations is not lost.
    let shutdown = conn.shutdown.notified();
    tokio::pin!(shutdown);
    loop {
        let frame = tokio::select! {
            frame = reader.read_frame() => frame?,
            _ = &mut shutdown => return Ok(()),
        };
        let Some(msg) = frame else {
            return Ok(());
        };
        dispatch(conn, msg).await?;
    }
}

async fn dispatch(conn: &Arc<Connection>, msg: ControlMessage) -> anyhow::Result<()> {
    match msg {
        // Server requests a back-channel for a public TCP connection.
        ControlMessage::Proxy { id, .. } => {
            let conn = conn.clone();
            tokio::spawn(async move {
                proxy::handle_proxy(conn, id).await;
            });
        }

        ControlMessage::UdpOpen { id, remote_addr, protocol } => {
            if protocol.as_deref().is_some_and(|p| !p.eq_ignore_ascii_case("udp")) {
                return Ok(());
            }
            udp::handle_open(conn.clone(), id, remote_addr).await;
        }

        ControlMessage::UdpClose { id, .. } => {
            udp::handle_close(conn, &id, false).await;
        }

        ControlMessage::Ping => {
            conn.send(&ControlMessage::Pong).await?;
        }

        ControlMessage::Pong => {
            if let Some(rtt) = conn.record_pong() {
                debug!("control rtt {} ms", rtt.as_millis());
            }
        }

        ControlMessage::HttpRequest {
            id,
            method,
            path,
            headers,
            body,
        } => {
            let conn = conn.clone();
            tokio::spawn(async move {
                http::handle_request(conn, id, method, path, headers, body).await;
            });
        }

        ControlMessage::Error { error } => {
            error!("server error: {}", error);
        }

        other => {
            if conn.warn_unknown_once() {
                warn!("unhandled control message: {:?}", other);
            }
        }
    }
    Ok(())
}

/// Emits a ping every [`PING_INTERVAL`], stamping the send time so the
/// matching pong yields an RTT.
async fn heartbeat_loop(conn: Arc<Connection>) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                conn.mark_ping_sent();
                if conn.send(&ControlMessage::Ping).await.is_err() {
                    return;
                }
            }
            _ = conn.shutdown.notified() => return,
        }
    }
}

fn decode_secret(encoded: &str) -> Option<[u8; 32]> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    let bytes = BASE64.decode(encoded).ok()?;
    bytes.try_into().ok()
}
