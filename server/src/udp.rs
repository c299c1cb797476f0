//! # UDP Datapath (server side)
//!
//! One UDP socket shares the tunnel control port. Clients handshake and
//! push encrypted DATA frames on it; flows are announced out-of-band via
//! `udp_open` on the TCP control channel, after which the server dials
//! the remote peer and relays datagrams both ways. The reader task is
//! never blocked by payload work: every received packet is handed to its
//! own task.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tunnel_protocol::crypto::{self, SECRET_LEN};
use tunnel_protocol::frame::{self, UdpMsgType};

use crate::state::{ClientSession, Core, Protocol};

/// Maximum UDP datagram we accept.
const MAX_DATAGRAM: usize = 65_535;

/// One server-side UDP flow: a connected socket to the remote peer plus
/// the client's last observed public address for return traffic.
pub struct UdpFlow {
    pub id: String,
    pub client_key: String,
    pub udp_secret: [u8; SECRET_LEN],
    pub backend: Arc<UdpSocket>,
    /// Updated on every inbound datagram; NAT rebinding moves it.
    pub client_addr: StdMutex<Option<SocketAddr>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl UdpFlow {
    fn close(&self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Receive loop on the shared UDP socket. Spawned once at startup.
pub async fn run_udp_server(core: Arc<Core>) {
    let Some(socket) = core.udp_socket.clone() else {
        return;
    };
    info!("udp server listening on port {}", core.config.tunnel_port);

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, addr) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("udp control read error: {}", e);
                continue;
            }
        };
        if n == 0 {
            continue;
        }
        let packet = buf[..n].to_vec();
        let core = core.clone();
        tokio::spawn(async move {
            handle_packet(core, packet, addr).await;
        });
    }
}

async fn handle_packet(core: Arc<Core>, packet: Vec<u8>, addr: SocketAddr) {
    let frame = match frame::decode(&packet) {
        Ok(frame) if !frame.key.is_empty() => frame,
        _ => return,
    };

    match frame.msg_type {
        UdpMsgType::Handshake => {
            send_frame(&core, UdpMsgType::Handshake, frame.key, "", &[], addr).await;
        }
        UdpMsgType::Ping => {
            // Payload is the client's timestamp; echo it back verbatim.
            send_frame(&core, UdpMsgType::Pong, frame.key, "", frame.payload, addr).await;
        }
        UdpMsgType::Pong => {}
        UdpMsgType::Data => {
            handle_data(&core, frame.key, frame.id, frame.payload, addr).await;
        }
        UdpMsgType::Close => {
            if !frame.id.is_empty() {
                close_flow(&core, frame.id);
            }
        }
    }
}

/// Inbound DATA from the client: authenticate against the flow's key,
/// remember the sender address, decrypt, forward to the remote peer.
async fn handle_data(core: &Arc<Core>, key: &str, id: &str, payload: &[u8], addr: SocketAddr) {
    let Some(flow) = core.udp_flows.get(id).map(|e| e.value().clone()) else {
        debug!("udp data for unknown flow {}", id);
        return;
    };
    if flow.client_key != key {
        debug!("udp data with mismatched key for flow {}", id);
        return;
    }

    *flow.client_addr.lock().unwrap() = Some(addr);

    let plaintext = match crypto::open(&flow.udp_secret, payload) {
        Ok(p) => p,
        Err(e) => {
            debug!("udp decryption failed for flow {}: {}", id, e);
            return;
        }
    };

    if flow.backend.send(&plaintext).await.is_err() {
        close_flow(core, id);
    }
}

/// `udp_open` from the control channel: rate-limit, filter the target,
/// dial it and start relaying.
pub async fn handle_open(
    core: Arc<Core>,
    session: Arc<ClientSession>,
    id: String,
    remote_addr: String,
) {
    if session.protocol != Protocol::Udp || id.trim().is_empty() {
        return;
    }
    if !core.rate_limits.allow_udp_open(session.remote_ip) {
        warn!(
            "udp flow rate limit exceeded for {} (client {})",
            session.remote_ip, session.client_id
        );
        return;
    }

    let remote_addr = remote_addr.trim();
    if remote_addr.is_empty() {
        debug!("udp_open without a remote address");
        return;
    }
    let addr = match tokio::net::lookup_host(remote_addr).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr,
            None => {
                debug!("udp remote address {} did not resolve", remote_addr);
                return;
            }
        },
        Err(e) => {
            debug!("invalid udp remote address {}: {}", remote_addr, e);
            return;
        }
    };
    if is_restricted(addr.ip()) {
        warn!("blocked udp flow to restricted address {}", remote_addr);
        return;
    }

    let backend = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("failed to open udp backend socket: {}", e);
            return;
        }
    };
    if let Err(e) = backend.connect(addr).await {
        warn!("failed to connect udp backend to {}: {}", addr, e);
        return;
    }

    let flow = Arc::new(UdpFlow {
        id: id.clone(),
        client_key: session.key.clone(),
        udp_secret: session.udp_secret,
        backend: Arc::new(backend),
        client_addr: StdMutex::new(None),
        reader: StdMutex::new(None),
    });

    // A racing open with the same ID replaces and closes the old flow.
    if let Some(old) = core.udp_flows.insert(id.clone(), flow.clone()) {
        old.close();
    }

    let handle = tokio::spawn(backend_read_loop(core.clone(), flow.clone()));
    *flow.reader.lock().unwrap() = Some(handle);

    info!("udp flow {} opened for {}", id, remote_addr);
}

/// Relays datagrams from the remote peer back to the client, sealed
/// under the session secret. Dropped silently until the client's public
/// address is known.
async fn backend_read_loop(core: Arc<Core>, flow: Arc<UdpFlow>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = match flow.backend.recv(&mut buf).await {
            Ok(n) => n,
            Err(_) => break,
        };
        if n == 0 {
            continue;
        }
        let client_addr = *flow.client_addr.lock().unwrap();
        let Some(client_addr) = client_addr else {
            continue;
        };
        let sealed = match crypto::seal(&flow.udp_secret, &buf[..n]) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("udp encryption failed for flow {}: {}", flow.id, e);
                continue;
            }
        };
        let packet = frame::encode(UdpMsgType::Data, &flow.client_key, &flow.id, &sealed);
        let Some(socket) = core.udp_socket.as_ref() else {
            break;
        };
        if socket.send_to(&packet, client_addr).await.is_err() {
            break;
        }
    }
    close_flow(&core, &flow.id);
}

/// Removes and closes one flow. Subsequent DATA for the ID is dropped.
pub fn close_flow(core: &Arc<Core>, id: &str) {
    if let Some((_, flow)) = core.udp_flows.remove(id) {
        flow.close();
        info!("udp flow {} closed", id);
    }
}

/// Session teardown: no flow outlives its owning session.
pub fn close_flows_for_session(core: &Arc<Core>, client_key: &str) {
    let ids: Vec<String> = core
        .udp_flows
        .iter()
        .filter(|e| e.value().client_key == client_key)
        .map(|e| e.key().clone())
        .collect();
    for id in ids {
        close_flow(core, &id);
    }
}

async fn send_frame(
    core: &Arc<Core>,
    msg_type: UdpMsgType,
    key: &str,
    id: &str,
    payload: &[u8],
    addr: SocketAddr,
) {
    let Some(socket) = core.udp_socket.as_ref() else {
        return;
    };
    let packet = frame::encode(msg_type, key, id, payload);
    if let Err(e) = socket.send_to(&packet, addr).await {
        debug!("udp send to {} failed: {}", addr, e);
    }
}

/// Loopback, private-range, link-local, unique-local and multicast
/// targets are refused to keep the server from being used as a probe
/// into its own network.
pub fn is_restricted(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (seg[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (seg[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    #[test]
    fn restricted_targets_are_refused() {
        assert!(is_restricted(ip("127.0.0.1")));
        assert!(is_restricted(ip("10.1.2.3")));
        assert!(is_restricted(ip("172.16.0.9")));
        assert!(is_restricted(ip("192.168.1.1")));
        assert!(is_restricted(ip("169.254.0.5")));
        assert!(is_restricted(ip("224.0.0.1")));
        assert!(is_restricted(ip("0.0.0.0")));
        assert!(is_restricted(ip("::1")));
        assert!(is_restricted(ip("fc00::1")));
        assert!(is_restricted(ip("fd12::8")));
        assert!(is_restricted(ip("fe80::1")));
        assert!(is_restricted(ip("ff02::1")));
    }

    #[test]
    fn public_targets_are_allowed() {
        assert!(!is_restricted(ip("1.1.1.1")));
        assert!(!is_restricted(ip("93.184.216.34")));
        assert!(!is_restricted(ip("2606:4700::1111")));
    }
}
