//! # UDP Datapath (client)
//!
//! The client dials the server's UDP socket, handshakes, then relays
//! encrypted DATA frames between the server and per-flow local backend
//! sockets. A keepalive ping keeps an eye on the UDP path independently
//! of the TCP control channel, and a per-flow probe closes flows whose
//! backend has stopped replying.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tunnel_protocol::crypto::{self, SECRET_LEN};
use tunnel_protocol::frame::{self, UdpMsgType};
use tunnel_protocol::message::ControlMessage;

use crate::state::Connection;

/// Keepalive ping cadence after a successful handshake.
const UDP_PING_INTERVAL: Duration = Duration::from_secs(3);
/// Missing pongs for this long flip the status to `timeout`.
const UDP_CTRL_TIMEOUT: Duration = Duration::from_secs(6);
/// One backend-silence probe period.
const BACKEND_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
/// Consecutive silent probes before the flow is closed.
const BACKEND_IDLE_RETRIES: u32 = 3;
/// Handshake retry cadence and budget.
const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const HANDSHAKE_MAX_RETRIES: u32 = 20;

const MAX_DATAGRAM: usize = 65_535;

/// The client's UDP channel to the server: one socket, a readiness flag
/// and the flow table.
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    key: String,
    secret: Option<[u8; SECRET_LEN]>,
    ready: AtomicBool,
    status: StdMutex<String>,
    last_pong: StdMutex<Instant>,
    warned_timeout: AtomicBool,
    flows: DashMap<String, Arc<ClientFlow>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl UdpChannel {
    pub fn status(&self) -> String {
        self.status.lock().unwrap().clone()
    }

    fn set_status(&self, status: impl Into<String>) {
        *self.status.lock().unwrap() = status.into();
    }

    fn own_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(handle);
    }

    /// Closes the channel and every flow. The socket drops with the last
    /// task holding it.
    pub fn close(&self) {
        self.set_status("offline");
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        let ids: Vec<String> = self.flows.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, flow)) = self.flows.remove(&id) {
                flow.close();
            }
        }
    }

    async fn send_frame(
        &self,
        msg_type: UdpMsgType,
        id: &str,
        payload: &[u8],
    ) -> std::io::Result<()> {
        let packet = frame::encode(msg_type, &self.key, id, payload);
        self.socket.send(&packet).await.map(|_| ())
    }
}

/// One local flow: a connected socket to the local backend plus its
/// relay and idle-probe tasks.
pub struct ClientFlow {
    pub id: String,
    backend: Arc<UdpSocket>,
    closed: AtomicBool,
    reader: StdMutex<Option<JoinHandle<()>>>,
    idle_probe: StdMutex<Option<JoinHandle<()>>>,
}

impl ClientFlow {
    /// Returns true on the first close.
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.idle_probe.lock().unwrap().take() {
            handle.abort();
        }
        true
    }
}

/// Dials the server's UDP socket and starts the handshake. Called once
/// per control connection when the tunnel protocol is `udp`.
pub async fn setup_channel(conn: Arc<Connection>) -> anyhow::Result<()> {
    let client = &conn.client;
    let key = client
        .key()
        .ok_or_else(|| anyhow::anyhow!("no session key for udp channel"))?;

    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect(&client.config.server_addr).await?;

    let channel = Arc::new(UdpChannel {
        socket: Arc::new(socket),
        key,
        secret: client.udp_secret(),
        ready: AtomicBool::new(false),
        status: StdMutex::new("handshake".into()),
        last_pong: StdMutex::new(Instant::now()),
        warned_timeout: AtomicBool::new(false),
        flows: DashMap::new(),
        tasks: StdMutex::new(Vec::new()),
    });
    *conn.udp.lock().unwrap() = Some(channel.clone());

    channel.own_task(tokio::spawn(read_loop(conn.clone(), channel.clone())));
    channel.own_task(tokio::spawn(handshake_loop(conn.clone(), channel.clone())));
    Ok(())
}

/// Sends an initial burst of handshakes, then retries on a fixed cadence
/// until the server mirrors one back or the budget runs out.
async fn handshake_loop(conn: Arc<Connection>, channel: Arc<UdpChannel>) {
    for i in 0..3u32 {
        if channel.send_frame(UdpMsgType::Handshake, "", &[]).await.is_err() {
            debug!("udp handshake burst #{} failed", i + 1);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut attempts = 0u32;
    let mut ticker = tokio::time::interval(HANDSHAKE_RETRY_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = conn.shutdown.notified() => return,
        }
        if channel.ready.load(Ordering::Acquire) {
            if attempts > 0 {
                info!("udp handshake succeeded after {} retries", attempts);
            }
            return;
        }
        attempts += 1;
        if attempts > HANDSHAKE_MAX_RETRIES {
            warn!("udp handshake failed after {} attempts", HANDSHAKE_MAX_RETRIES);
            channel.set_status("offline");
            return;
        }
        let _ = channel.send_frame(UdpMsgType::Handshake, "", &[]).await;
    }
}

/// Receive loop on the channel socket. Frames with a foreign key are
/// dropped.
async fn read_loop(conn: Arc<Connection>, channel: Arc<UdpChannel>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = match channel.socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(_) => return,
        };
        if n == 0 {
            continue;
        }
        let Ok(frame) = frame::decode(&buf[..n]) else {
            continue;
        };
        if frame.key != channel.key {
            continue;
        }

        match frame.msg_type {
            UdpMsgType::Handshake => {
                if !channel.ready.swap(true, Ordering::AcqRel) {
                    debug!("udp handshake complete");
                    *channel.last_pong.lock().unwrap() = Instant::now();
                    channel.set_status("pinging");
                    channel.own_task(tokio::spawn(ping_loop(
                        conn.clone(),
                        channel.clone(),
                    )));
                }
            }
            UdpMsgType::Pong => handle_pong(&channel, frame.payload),
            UdpMsgType::Ping => {
                let payload = frame.payload.to_vec();
                let _ = channel.send_frame(UdpMsgType::Pong, "", &payload).await;
            }
            UdpMsgType::Data => {
                let id = frame.id.to_string();
                let payload = frame.payload.to_vec();
                handle_data(&conn, &channel, id, payload).await;
            }
            UdpMsgType::Close => {
                let id = frame.id.to_string();
                remove_flow(&conn, &channel, &id, false).await;
            }
        }
    }
}

/// Keepalive: ping every interval with a nanosecond timestamp, and watch
/// for the pongs going missing. A UDP timeout only flips the status
/// indicator; TCP state is untouched.
async fn ping_loop(conn: Arc<Connection>, channel: Arc<UdpChannel>) {
    let mut ticker = tokio::time::interval(UDP_PING_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = conn.shutdown.notified() => return,
        }
        let payload = now_nanos().to_be_bytes();
        let _ = channel.send_frame(UdpMsgType::Ping, "", &payload).await;

        let silent = channel.last_pong.lock().unwrap().elapsed();
        if silent > UDP_CTRL_TIMEOUT {
            if !channel.warned_timeout.swap(true, Ordering::AcqRel) {
                channel.set_status("timeout");
                warn!("udp keepalive timeout (>{:?})", UDP_CTRL_TIMEOUT);
            }
        }
    }
}

fn handle_pong(channel: &Arc<UdpChannel>, payload: &[u8]) {
    if payload.len() < 8 {
        return;
    }
    let mut sent_bytes = [0u8; 8];
    sent_bytes.copy_from_slice(&payload[..8]);
    let sent = u64::from_be_bytes(sent_bytes);
    let rtt_ms = now_nanos().saturating_sub(sent) / 1_000_000;
    *channel.last_pong.lock().unwrap() = Instant::now();
    channel.warned_timeout.store(false, Ordering::Release);
    channel.set_status(format!("ok ({} ms)", rtt_ms));
}

/// Server DATA for a flow: decrypt, hand to the local backend, and arm
/// the idle probe that notices a silent backend.
async fn handle_data(
    conn: &Arc<Connection>,
    channel: &Arc<UdpChannel>,
    id: String,
    payload: Vec<u8>,
) {
    let plaintext = match channel.secret {
        Some(secret) => match crypto::open(&secret, &payload) {
            Ok(p) => p,
            Err(e) => {
                debug!("udp decryption failed for flow {}: {}", id, e);
                return;
            }
        },
        None => payload,
    };

    let Some(flow) = channel.flows.get(&id).map(|e| e.value().clone()) else {
        return;
    };
    if flow.backend.send(&plaintext).await.is_err() {
        warn!("backend write failed for flow {}", id);
        remove_flow(conn, channel, &id, true).await;
        return;
    }
    conn.client.stats.add_down(plaintext.len() as u64);
    arm_idle_probe(conn, channel, &flow);
}

/// `udp_open` from the server: connect a socket to the local backend and
/// start relaying its replies.
pub async fn handle_open(conn: Arc<Connection>, id: String, remote_addr: String) {
    if conn.client.config.protocol != "udp" || id.trim().is_empty() {
        return;
    }
    let Some(channel) = conn.udp_channel() else {
        warn!("udp_open {} before the udp channel is up", id);
        return;
    };

    let backend = match connect_backend(&conn.client.config.local_addr).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(
                "cannot reach udp backend {}: {}",
                conn.client.config.local_addr, e
            );
            send_close(&conn, &channel, &id).await;
            return;
        }
    };

    let flow = Arc::new(ClientFlow {
        id: id.clone(),
        backend: Arc::new(backend),
        closed: AtomicBool::new(false),
        reader: StdMutex::new(None),
        idle_probe: StdMutex::new(None),
    });

    // A racing open with the same ID replaces and closes the old flow.
    if let Some(old) = channel.flows.insert(id.clone(), flow.clone()) {
        if old.close() {
            conn.client.stats.connection_closed();
        }
    }
    conn.client.stats.connection_opened();

    let handle = tokio::spawn(backend_read_loop(
        conn.clone(),
        channel.clone(),
        flow.clone(),
    ));
    *flow.reader.lock().unwrap() = Some(handle);

    debug!("udp flow {} opened (remote {})", id, remote_addr.trim());
}

async fn connect_backend(local_addr: &str) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect(local_addr).await?;
    Ok(socket)
}

/// Relays backend replies up to the server, sealed under the session
/// secret. A backend reply also disarms the idle probe.
async fn backend_read_loop(conn: Arc<Connection>, channel: Arc<UdpChannel>, flow: Arc<ClientFlow>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = match flow.backend.recv(&mut buf).await {
            Ok(n) => n,
            Err(_) => break,
        };
        if n == 0 {
            continue;
        }
        disarm_idle_probe(&flow);

        let payload = match channel.secret {
            Some(secret) => match crypto::seal(&secret, &buf[..n]) {
                Ok(sealed) => sealed,
                Err(e) => {
                    warn!("udp encryption failed for flow {}: {}", flow.id, e);
                    continue;
                }
            },
            None => buf[..n].to_vec(),
        };
        if channel
            .send_frame(UdpMsgType::Data, &flow.id, &payload)
            .await
            .is_err()
        {
            break;
        }
        conn.client.stats.add_up(n as u64);
    }
    remove_flow(&conn, &channel, &flow.id, true).await;
}

/// (Re)arms the probe: if the backend stays silent for three consecutive
/// periods after server traffic, the flow is reported idle and closed.
fn arm_idle_probe(conn: &Arc<Connection>, channel: &Arc<UdpChannel>, flow: &Arc<ClientFlow>) {
    let probe = tokio::spawn({
        let conn = conn.clone();
        let channel = channel.clone();
        let flow = flow.clone();
        async move {
            for attempt in 1..=BACKEND_IDLE_RETRIES {
                tokio::time::sleep(BACKEND_IDLE_TIMEOUT).await;
                debug!(
                    "backend silent for flow {} ({}/{})",
                    flow.id, attempt, BACKEND_IDLE_RETRIES
                );
            }
            warn!("backend not responding for flow {}, closing", flow.id);
            let _ = conn
                .send(&ControlMessage::UdpIdle {
                    id: flow.id.clone(),
                    protocol: Some("udp".into()),
                })
                .await;
            remove_flow(&conn, &channel, &flow.id, false).await;
        }
    });
    if let Some(old) = flow.idle_probe.lock().unwrap().replace(probe) {
        old.abort();
    }
}

fn disarm_idle_probe(flow: &Arc<ClientFlow>) {
    if let Some(handle) = flow.idle_probe.lock().unwrap().take() {
        handle.abort();
    }
}

/// Removes one flow; `notify` tells the server it is gone.
pub async fn remove_flow(
    conn: &Arc<Connection>,
    channel: &Arc<UdpChannel>,
    id: &str,
    notify: bool,
) {
    let Some((_, flow)) = channel.flows.remove(id) else {
        return;
    };
    if flow.close() {
        conn.client.stats.connection_closed();
        debug!("udp flow {} closed", id);
    }
    if notify {
        send_close(conn, channel, id).await;
    }
}

/// `udp_close` from the server (or a local failure path).
pub async fn handle_close(conn: &Arc<Connection>, id: &str, notify: bool) {
    if id.trim().is_empty() {
        return;
    }
    let Some(channel) = conn.udp_channel() else {
        return;
    };
    remove_flow(conn, &channel, id, notify).await;
}

/// Tells the server a flow is gone, on both the datagram path and the
/// control channel.
async fn send_close(conn: &Arc<Connection>, channel: &Arc<UdpChannel>, id: &str) {
    let _ = channel.send_frame(UdpMsgType::Close, id, &[]).await;
    let _ = conn
        .send(&ControlMessage::UdpClose {
            id: id.to_string(),
            protocol: Some("udp".into()),
        })
        .await;
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
