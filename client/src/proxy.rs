//! # Back-Channel Proxy (client)
//!
//! When the server announces a public TCP connection, the client dials
//! its local backend, opens a fresh TLS connection to the server tagged
//! with the request ID, and pipes bytes both ways. A backend dial
//! failure is reported back as `proxy_error` so the server can drop the
//! public socket immediately instead of waiting out its timeout.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use tunnel_protocol::codec::FrameWriter;
use tunnel_protocol::message::ControlMessage;

use crate::state::Connection;

/// Splice buffer size per direction.
const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Handles one `proxy` request from the server.
pub async fn handle_proxy(conn: Arc<Connection>, id: String) {
    let client = &conn.client;
    if client.config.protocol == "udp" {
        debug!("ignoring tcp proxy request while in udp mode");
        return;
    }
    if id.trim().is_empty() {
        return;
    }

    // Local backend first; without it there is nothing to proxy.
    let backend = match TcpStream::connect(&client.config.local_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                "cannot reach backend {}: {}",
                client.config.local_addr, e
            );
            let _ = conn
                .send(&ControlMessage::ProxyError {
                    id,
                    error: e.to_string(),
                })
                .await;
            return;
        }
    };

    // Fresh TLS connection to the server, tagged as the back-channel.
    let server_conn = async {
        let stream = TcpStream::connect(&client.config.server_addr).await?;
        let _ = stream.set_nodelay(true);
        let name = crate::tls::server_name(&client.config.server_addr)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        client.connector.connect(name, stream).await
    }
    .await;
    let server_stream = match server_conn {
        Ok(stream) => stream,
        Err(e) => {
            warn!("back-channel connect failed: {}", e);
            let _ = conn
                .send(&ControlMessage::ProxyError {
                    id,
                    error: e.to_string(),
                })
                .await;
            return;
        }
    };

    let (server_read, server_write) = tokio::io::split(server_stream);
    let mut writer = FrameWriter::new(server_write);
    let tag = ControlMessage::Proxy {
        id: id.clone(),
        key: client.key(),
        client_id: Some(client.config.client_id.clone()),
    };
    if writer.write_frame(&tag).await.is_err() {
        warn!("failed to tag back-channel {}", id);
        return;
    }
    let server_write = writer.into_inner();

    client.stats.connection_opened();

    let (backend_read, backend_write) = backend.into_split();

    // Backend → server is upstream.
    let stats = client.stats.clone();
    let mut up = tokio::spawn(copy_counted(backend_read, server_write, {
        let stats = stats.clone();
        move |n| stats.add_up(n)
    }));
    let stats = client.stats.clone();
    let mut down = tokio::spawn(copy_counted(server_read, backend_write, move |n| {
        stats.add_down(n)
    }));

    tokio::select! {
        _ = &mut up => down.abort(),
        _ = &mut down => up.abort(),
    }

    client.stats.connection_closed();
}

/// Copies `src` into `dst` until EOF or error, reporting each chunk to
/// `count`, then propagates the shutdown.
async fn copy_counted<R, W, F>(mut src: R, mut dst: W, count: F)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        count(n as u64);
        if dst.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = dst.shutdown().await;
}
