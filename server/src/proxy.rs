//! # TCP Proxy Path
//!
//! For each `tcp` session the server runs a public listener on the
//! assigned port. Every accepted public connection gets a fresh request
//! ID and a one-shot waiter; the client is told to dial back over a new
//! TLS connection tagged with that ID, and the two sockets are spliced
//! until either side closes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use tunnel_protocol::ids::generate_id;
use tunnel_protocol::message::ControlMessage;

use crate::state::{Backchannel, ClientSession, Core, ProxyOutcome};

/// How long a public connection waits for the client to dial back.
const PROXY_TIMEOUT: Duration = Duration::from_secs(10);
/// Splice buffer size per direction.
const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Accept loop on the session's public port. Owned by the session, so it
/// ends with it; bind failures only disable this tunnel.
pub async fn run_public_listener(core: Arc<Core>, session: Arc<ClientSession>) {
    let Some(port) = session.public_port else {
        return;
    };
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to listen on public port {}: {}", port, e);
            return;
        }
    };
    info!(
        "public listener started on port {} for client {}",
        port, session.client_id
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((conn, _peer)) => {
                    session.total_conns.fetch_add(1, Ordering::Relaxed);
                    let core = core.clone();
                    let session = session.clone();
                    tokio::spawn(async move {
                        handle_public_connection(core, session, conn).await;
                    });
                }
                Err(e) => {
                    warn!("public listener error on port {}: {}", port, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = session.shutdown.notified() => return,
        }
    }
}

/// One public connection: register a waiter, notify the client, wait for
/// the dial-back, splice.
async fn handle_public_connection(
    _core: Arc<Core>,
    session: Arc<ClientSession>,
    public_conn: TcpStream,
) {
    let id = generate_id();
    let (tx, rx) = oneshot::channel();
    session.proxy_waiters.insert(id.clone(), tx);

    let notify = ControlMessage::Proxy {
        id: id.clone(),
        key: Some(session.key.clone()),
        client_id: Some(session.client_id.clone()),
    };
    if session.send(&notify).await.is_err() {
        session.proxy_waiters.remove(&id);
        return;
    }

    let outcome = tokio::time::timeout(PROXY_TIMEOUT, rx).await;
    session.proxy_waiters.remove(&id);

    match outcome {
        Ok(Ok(ProxyOutcome::Connected(backchannel))) => {
            splice(session, public_conn, backchannel).await;
        }
        // Explicit cancellation or a torn-down session; the public
        // socket drops on return.
        Ok(Ok(ProxyOutcome::Cancelled)) | Ok(Err(_)) => {
            debug!("client refused proxy connection {}", id);
        }
        Err(_) => {
            static TIMEOUTS: AtomicU64 = AtomicU64::new(0);
            if TIMEOUTS.fetch_add(1, Ordering::Relaxed) % 50 == 0 {
                warn!("timeout waiting for client back-channel (id {})", id);
            }
        }
    }
}

/// Splices public socket and back-channel bidirectionally with counted
/// 32 KiB copies. Either direction ending shuts the other down.
async fn splice(session: Arc<ClientSession>, public_conn: TcpStream, backchannel: Backchannel) {
    session.active_conns.fetch_add(1, Ordering::Relaxed);

    let (public_read, public_write) = public_conn.into_split();
    let Backchannel {
        reader: back_read,
        writer: back_write,
    } = backchannel;

    // Client → public is upstream (backend bytes reaching the viewer).
    let mut up = tokio::spawn(copy_counted(back_read, public_write, session.clone(), true));
    let mut down = tokio::spawn(copy_counted(public_read, back_write, session.clone(), false));

    tokio::select! {
        _ = &mut up => down.abort(),
        _ = &mut down => up.abort(),
    }

    session.active_conns.fetch_sub(1, Ordering::Relaxed);
}

/// Copies `src` into `dst`, adding to the session's byte counter, until
/// EOF or an error, then propagates the shutdown.
async fn copy_counted<R, W>(mut src: R, mut dst: W, session: Arc<ClientSession>, upstream: bool)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let counter = if upstream {
            &session.bytes_up
        } else {
            &session.bytes_down
        };
        counter.fetch_add(n as u64, Ordering::Relaxed);
        if dst.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = dst.shutdown().await;
}
