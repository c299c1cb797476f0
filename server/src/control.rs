//! # Control-Channel Handling
//!
//! Contains the tunnel server's core connection logic:
//! - Accepting TLS connections under the admission semaphore
//! - Classifying the first frame (`register` = new control channel,
//!   `proxy` = back-channel for a waiting public connection)
//! - Registration: key/port/subdomain assignment and the `registered`
//!   reply
//! - The per-session control loop and message dispatch
//! - Idle detection and session teardown

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::ReadHalf;
use tokio::net::TcpListener;
use tokio::sync::OwnedSemaphorePermit;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use tunnel_protocol::codec::{CodecError, FrameReader, FrameWriter};
use tunnel_protocol::ids::{generate_id, generate_subdomain};
use tunnel_protocol::message::ControlMessage;
use tunnel_protocol::{crypto, VERSION};

use crate::state::{Backchannel, ClientSession, ControlStream, Core, Protocol, ProxyOutcome};
use crate::{proxy, udp};

/// How often the watcher samples the liveness clock.
const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(20);
/// A session silent for this long is disconnected.
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs the tunnel accept loop. Failure to bind is fatal; everything
/// after that is per-connection.
pub async fn run_tunnel_listener(core: Arc<Core>, acceptor: TlsAcceptor) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", core.config.tunnel_port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind tunnel port {}: {}", addr, e))?;
    info!("tunnel server listening on {} (TLS)", addr);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("tunnel accept error: {}", e);
                continue;
            }
        };

        match core.admission.clone().try_acquire_owned() {
            Ok(permit) => {
                let core = core.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    handle_connection(core, acceptor, stream, peer, permit).await;
                });
            }
            Err(_) => {
                // Saturated: drop the socket before the TLS handshake.
                drop(stream);
                static REJECTED: AtomicU64 = AtomicU64::new(0);
                if REJECTED.fetch_add(1, Ordering::Relaxed) % 100 == 0 {
                    warn!("connection limit reached, rejecting new connections");
                }
            }
        }
    }
}

/// Handles one accepted connection: TLS handshake, first-frame
/// classification, then either the registration path or back-channel
/// dispatch. The admission permit is held for the connection's lifetime.
async fn handle_connection(
    core: Arc<Core>,
    acceptor: TlsAcceptor,
    stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
    _permit: OwnedSemaphorePermit,
) {
    let _ = stream.set_nodelay(true);
    let tls = match acceptor.accept(stream).await {
        Ok(tls) => tls,
        Err(e) => {
            debug!("tls handshake failed from {}: {}", peer, e);
            return;
        }
    };

    let (read_half, write_half) = tokio::io::split(tls);
    let mut reader = FrameReader::new(read_half);
    let writer = FrameWriter::new(write_half);

    match reader.read_frame().await {
        Ok(Some(ControlMessage::Register {
            key,
            client_id,
            target,
            protocol,
            requested_port,
        })) => {
            handle_register(
                core,
                reader,
                writer,
                peer,
                RegisterRequest {
                    key,
                    client_id,
                    target,
                    protocol,
                    requested_port,
                },
            )
            .await;
        }
        Ok(Some(ControlMessage::Proxy { id, key, .. })) => {
            dispatch_backchannel(core, reader, writer, key, id);
        }
        Ok(Some(other)) => {
            warn!("unexpected handshake frame from {}: {:?}", peer, other);
        }
        Ok(None) => {}
        Err(e) => {
            debug!("failed to decode handshake from {}: {}", peer, e);
        }
    }
}

struct RegisterRequest {
    key: Option<String>,
    client_id: Option<String>,
    target: Option<String>,
    protocol: Option<String>,
    requested_port: Option<u16>,
}

/// The registration path: rate limit, identity assignment, port and
/// subdomain allocation, the `registered` reply, then the control loop
/// until disconnect.
async fn handle_register(
    core: Arc<Core>,
    reader: FrameReader<ReadHalf<ControlStream>>,
    mut writer: FrameWriter<tokio::io::WriteHalf<ControlStream>>,
    peer: std::net::SocketAddr,
    req: RegisterRequest,
) {
    if !core.rate_limits.allow_registration(peer.ip()) {
        warn!("registration rate limit exceeded for {}", peer.ip());
        reject(&mut writer, "registration rate limit exceeded").await;
        return;
    }

    let key = match req.key.map(|k| k.trim().to_string()) {
        Some(k) if !k.is_empty() => k,
        _ => generate_id(),
    };
    let client_id = match req.client_id.map(|c| c.trim().to_string()) {
        Some(c) if !c.is_empty() => c,
        _ => format!("client-{}", &key[..8]),
    };
    let protocol = Protocol::parse(req.protocol.as_deref());
    let target = req.target.unwrap_or_default();

    let Some(public_port) = core.ports.lock().await.acquire(&key, req.requested_port) else {
        tracing::error!("public port pool exhausted, rejecting {}", client_id);
        reject(&mut writer, "no public ports available").await;
        return;
    };

    let subdomain = if protocol == Protocol::Http {
        if !core.http_enabled() {
            warn!("client {} requested http tunneling but no HTTP_DOMAIN is set", client_id);
            reject(&mut writer, "http tunneling unavailable").await;
            core.ports.lock().await.release(&key, public_port);
            return;
        }
        Some(reserve_subdomain(&core))
    } else {
        None
    };

    let udp_secret = crypto::generate_secret();

    let session = Arc::new(ClientSession::new(
        client_id.clone(),
        key.clone(),
        target,
        protocol,
        Some(public_port),
        subdomain.clone(),
        udp_secret,
        peer.ip(),
        writer,
    ));

    // At most one session per client ID; a reconnect racing its own
    // stale session displaces it.
    if let Some(old) = core.sessions.insert(client_id.clone(), session.clone()) {
        old.close();
    }
    core.sessions_by_key.insert(key.clone(), session.clone());
    if let Some(label) = &subdomain {
        core.subdomains.insert(label.clone(), session.clone());
    }

    let registered = ControlMessage::Registered {
        key: key.clone(),
        client_id: client_id.clone(),
        remote_port: public_port,
        protocol: protocol.as_str().to_string(),
        version: VERSION.to_string(),
        subdomain: subdomain.clone(),
        base_domain: core.config.http_domain.clone(),
        udp_secret: Some(base64_encode(&udp_secret)),
    };
    if session.send(&registered).await.is_err() {
        teardown(&core, &session).await;
        return;
    }

    match &subdomain {
        Some(label) => info!(
            "client {} registered, http mode, subdomain {}.{}",
            client_id,
            label,
            core.config.http_domain.as_deref().unwrap_or_default()
        ),
        None => info!(
            "client {} registered, public port {}, protocol {}, target {}",
            client_id,
            public_port,
            protocol.as_str(),
            session.target
        ),
    }

    session.own_task(tokio::spawn(heartbeat_watcher(session.clone())));
    if protocol == Protocol::Tcp {
        session.own_task(tokio::spawn(proxy::run_public_listener(
            core.clone(),
            session.clone(),
        )));
    }

    if let Err(e) = control_loop(&core, &session, reader).await {
        warn!("client {} control error: {}", client_id, e);
    }
    teardown(&core, &session).await;
}

/// Processes control frames until disconnect, shutdown or a protocol
/// error. Every inbound frame stamps the liveness clock.
async fn control_loop(
    core: &Arc<Core>,
    session: &Arc<ClientSession>,
    mut reader: FrameReader<ReadHalf<ControlStream>>,
) -> Result<(), CodecError> {
    // Pinned once so a shutdown fired between iterations is not lost.
    let shutdown = session.shutdown.notified();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            frame = reader.read_frame() => match frame {
                Ok(Some(msg)) => {
                    session.touch();
                    dispatch(core, session, msg).await?;
                }
                Ok(None) => return Ok(()),
                Err(e) => return Err(e),
            },
            _ = &mut shutdown => return Ok(()),
        }
    }
}

/// Routes one control message. Write failures propagate and end the
/// session; everything else is handled locally.
async fn dispatch(
    core: &Arc<Core>,
    session: &Arc<ClientSession>,
    msg: ControlMessage,
) -> Result<(), CodecError> {
    match msg {
        ControlMessage::Ping => session.send(&ControlMessage::Pong).await?,

        // Tolerated in both directions; the touch above already counted
        // it for liveness.
        ControlMessage::Pong => {}

        // The client acknowledges a proxy request on the control channel;
        // the actual back-channel arrives as a fresh connection.
        ControlMessage::Proxy { id, .. } => {
            debug!("client {} acknowledged proxy {}", session.client_id, id);
        }

        ControlMessage::ProxyError { id, error } => {
            debug!("client {} proxy {} failed: {}", session.client_id, id, error);
            if let Some((_, tx)) = session.proxy_waiters.remove(&id) {
                let _ = tx.send(ProxyOutcome::Cancelled);
            }
        }

        ControlMessage::UdpOpen { id, remote_addr, .. } => {
            let core = core.clone();
            let session = session.clone();
            tokio::spawn(async move {
                udp::handle_open(core, session, id, remote_addr).await;
            });
        }

        ControlMessage::UdpClose { id, .. } => {
            udp::close_flow(core, &id);
        }

        ControlMessage::UdpIdle { id, .. } => {
            udp::close_flow(core, &id);
            session.send(&ControlMessage::UdpClose { id, protocol: None }).await?;
        }

        ControlMessage::HttpResponse {
            id,
            status_code,
            headers,
            body,
        } => match session.http_waiters.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(crate::state::HttpExchange {
                    status_code,
                    headers,
                    body,
                });
            }
            None => warn!("http response for unknown request id {}", id),
        },

        other => {
            if session.warn_unknown_once() {
                warn!(
                    "client {} sent an unhandled control message: {:?}",
                    session.client_id, other
                );
            }
        }
    }
    Ok(())
}

/// Ties an accepted back-channel to its waiting public connection. The
/// key proves ownership; the ID selects the waiter.
fn dispatch_backchannel(
    core: Arc<Core>,
    reader: FrameReader<ReadHalf<ControlStream>>,
    writer: FrameWriter<tokio::io::WriteHalf<ControlStream>>,
    key: Option<String>,
    id: String,
) {
    let Some(key) = key else {
        warn!("back-channel {} arrived without a key", id);
        return;
    };
    let Some(session) = core.sessions_by_key.get(&key).map(|e| e.value().clone()) else {
        warn!("back-channel {} for unknown session key", id);
        return;
    };
    let Some((_, tx)) = session.proxy_waiters.remove(&id) else {
        warn!("unexpected back-channel for id {}", id);
        return;
    };

    let backchannel = Backchannel {
        reader: reader.into_inner(),
        writer: writer.into_inner(),
    };
    // A failed send means the waiter already timed out; dropping the
    // streams closes the back-channel.
    let _ = tx.send(ProxyOutcome::Connected(backchannel));
}

/// Watches the liveness clock and closes the session when the client
/// goes silent.
async fn heartbeat_watcher(session: Arc<ClientSession>) {
    let mut ticker = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if session.is_closed() {
            return;
        }
        if session.idle_for() > CLIENT_IDLE_TIMEOUT {
            warn!("client {} idle timeout, disconnecting", session.client_id);
            session.close();
            return;
        }
    }
}

/// Full session teardown: cancel waiters and tasks, drop registry
/// entries this session still owns, release the public port into the
/// reservation table, and close owned UDP flows.
async fn teardown(core: &Arc<Core>, session: &Arc<ClientSession>) {
    session.close();

    core.sessions
        .remove_if(&session.client_id, |_, s| Arc::ptr_eq(s, session));
    core.sessions_by_key
        .remove_if(&session.key, |_, s| Arc::ptr_eq(s, session));
    if let Some(label) = &session.subdomain {
        core.subdomains.remove_if(label, |_, s| Arc::ptr_eq(s, session));
    }

    // Ports are unique per session, so this cannot touch a successor's
    // port even when the registry entries already belong to one.
    if let Some(port) = session.public_port {
        core.ports.lock().await.release(&session.key, port);
    }

    udp::close_flows_for_session(core, &session.key);

    info!("client {} disconnected", session.client_id);
}

/// Best-effort error reply before dropping a rejected registration.
async fn reject(
    writer: &mut FrameWriter<tokio::io::WriteHalf<ControlStream>>,
    reason: &str,
) {
    let _ = writer
        .write_frame(&ControlMessage::Error {
            error: reason.to_string(),
        })
        .await;
}

/// Picks an unused 6-hex-char subdomain label. Collisions are O(#active)
/// and resolved by regeneration.
fn reserve_subdomain(core: &Core) -> String {
    loop {
        let label = generate_subdomain();
        if !core.subdomains.contains_key(&label) {
            return label;
        }
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    BASE64.encode(bytes)
}
