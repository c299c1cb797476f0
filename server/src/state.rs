//! # Server State
//!
//! Holds the shared state for the tunnel server, injected into every task
//! as an `Arc<Core>`:
//! - **Session index**: client ID → live [`ClientSession`]
//! - **Key index**: session key → session (back-channel and UDP dispatch)
//! - **Subdomain registry**: leftmost DNS label → owning session
//! - **Port pool**: public port allocator with sticky reservations
//! - **Rate buckets**: per-source-IP token buckets
//! - **UDP flow table**: flow ID → server-side flow
//!
//! Registries use [`DashMap`] for concurrent access; the port pool sits
//! behind one async mutex. No task ever holds two of these regions at
//! once.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::{BufReader, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{oneshot, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;

use tunnel_protocol::codec::{CodecError, FrameWriter};
use tunnel_protocol::crypto::SECRET_LEN;
use tunnel_protocol::message::ControlMessage;

use crate::config::ServerConfig;
use crate::ports::PortPool;
use crate::ratelimit::RateLimiterMap;
use crate::udp::UdpFlow;

/// A TLS-wrapped control or back-channel stream.
pub type ControlStream = TlsStream<TcpStream>;

/// Tunnel protocol declared at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Http,
}

impl Protocol {
    /// Parses the wire string, defaulting to TCP like the original
    /// runtime did for empty or unrecognized values.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("udp") => Self::Udp,
            Some("http") => Self::Http,
            _ => Self::Tcp,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Http => "http",
        }
    }
}

/// A client back-channel delivered to a waiting public connection. The
/// buffered reader preserves any payload bytes that arrived behind the
/// handshake frame.
pub struct Backchannel {
    pub reader: BufReader<ReadHalf<ControlStream>>,
    pub writer: WriteHalf<ControlStream>,
}

/// Resolution of a TCP proxy waiter. A dropped sender (session teardown)
/// reads the same as `Cancelled` on the receiving side.
pub enum ProxyOutcome {
    Connected(Backchannel),
    Cancelled,
}

/// The response half of an in-flight HTTP exchange.
#[derive(Debug)]
pub struct HttpExchange {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// One registered tunnel client. Created on a successful `register`,
/// destroyed when the control channel disconnects.
pub struct ClientSession {
    pub client_id: String,
    pub key: String,
    pub target: String,
    pub protocol: Protocol,
    pub public_port: Option<u16>,
    pub subdomain: Option<String>,
    pub udp_secret: [u8; SECRET_LEN],
    pub remote_ip: IpAddr,

    /// Serialized control-channel writer. The mutex is held across the
    /// full encode+flush so frames never interleave.
    writer: Mutex<FrameWriter<WriteHalf<ControlStream>>>,

    last_seen: StdMutex<Instant>,

    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
    pub active_conns: AtomicI64,
    pub total_conns: AtomicU64,

    /// Pending TCP back-channel waiters, keyed by request ID.
    pub proxy_waiters: DashMap<String, oneshot::Sender<ProxyOutcome>>,
    /// Pending HTTP response waiters, keyed by request ID.
    pub http_waiters: DashMap<String, oneshot::Sender<HttpExchange>>,

    /// Fired once when the session closes; the control loop and the
    /// public listener select on this.
    pub shutdown: Notify,
    closed: AtomicBool,

    /// Watcher and listener tasks owned by this session, aborted on
    /// close.
    tasks: StdMutex<Vec<JoinHandle<()>>>,

    warned_unknown: AtomicBool,
}

impl ClientSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: String,
        key: String,
        target: String,
        protocol: Protocol,
        public_port: Option<u16>,
        subdomain: Option<String>,
        udp_secret: [u8; SECRET_LEN],
        remote_ip: IpAddr,
        writer: FrameWriter<WriteHalf<ControlStream>>,
    ) -> Self {
        Self {
            client_id,
            key,
            target,
            protocol,
            public_port,
            subdomain,
            udp_secret,
            remote_ip,
            writer: Mutex::new(writer),
            last_seen: StdMutex::new(Instant::now()),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            active_conns: AtomicI64::new(0),
            total_conns: AtomicU64::new(0),
            proxy_waiters: DashMap::new(),
            http_waiters: DashMap::new(),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
            warned_unknown: AtomicBool::new(false),
        }
    }

    /// Writes one frame on the control channel.
    pub async fn send(&self, msg: &ControlMessage) -> Result<(), CodecError> {
        self.writer.lock().await.write_frame(msg).await
    }

    /// Stamps the liveness clock. Called for every inbound frame.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().unwrap().elapsed()
    }

    /// Registers a task owned by this session. If the session already
    /// closed, the task is aborted immediately.
    pub fn own_task(&self, handle: JoinHandle<()>) {
        if self.is_closed() {
            handle.abort();
            return;
        }
        self.tasks.lock().unwrap().push(handle);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the session: wakes everything selecting on [`Self::shutdown`],
    /// aborts owned tasks and drops all pending waiters (the dropped
    /// one-shot senders act as the cancellation sentinel). Idempotent.
    /// Registry and port-pool cleanup happens in the connection handler,
    /// which owns the `Core`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_waiters();
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.proxy_waiters.clear();
        self.http_waiters.clear();
    }

    /// Returns true the first time an unknown control message shows up
    /// on this session, so it is logged once rather than per frame.
    pub fn warn_unknown_once(&self) -> bool {
        !self.warned_unknown.swap(true, Ordering::Relaxed)
    }
}

/// A point-in-time view of one session, served by the dashboard API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSnapshot {
    pub name: String,
    pub status: &'static str,
    pub protocol: &'static str,
    pub target: String,
    pub public_port: Option<u16>,
    pub public_host: String,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub active_connections: i64,
    pub total_connections: u64,
}

/// The server-wide aggregate, constructed once at startup and shared by
/// every task. Owning the registries here (rather than on the sessions)
/// keeps the ownership graph acyclic.
pub struct Core {
    pub config: ServerConfig,

    /// Live sessions keyed by client ID.
    pub sessions: DashMap<String, Arc<ClientSession>>,
    /// The same sessions keyed by secret key, for back-channel and UDP
    /// dispatch.
    pub sessions_by_key: DashMap<String, Arc<ClientSession>>,
    /// HTTP subdomain registry.
    pub subdomains: DashMap<String, Arc<ClientSession>>,

    pub ports: Mutex<PortPool>,
    pub rate_limits: RateLimiterMap,

    /// Server-side UDP flows keyed by flow ID.
    pub udp_flows: DashMap<String, Arc<UdpFlow>>,
    /// The single UDP socket sharing the tunnel control port. `None`
    /// when the UDP bind failed (UDP tunneling degraded, TCP unaffected).
    pub udp_socket: Option<Arc<UdpSocket>>,

    /// Bounds concurrently handled control connections.
    pub admission: Arc<Semaphore>,
}

impl Core {
    pub fn new(
        config: ServerConfig,
        udp_socket: Option<Arc<UdpSocket>>,
        max_connections: usize,
    ) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            sessions_by_key: DashMap::new(),
            subdomains: DashMap::new(),
            ports: Mutex::new(PortPool::new()),
            rate_limits: RateLimiterMap::new(),
            udp_flows: DashMap::new(),
            udp_socket,
            admission: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Whether the HTTPS demux is configured (a base domain is set).
    pub fn http_enabled(&self) -> bool {
        self.config.http_domain.is_some()
    }

    /// Snapshot of all live sessions plus aggregate byte counters, the
    /// read-only surface the dashboard consumes.
    pub fn snapshot(&self) -> (Vec<SessionSnapshot>, u64, u64) {
        let mut tunnels = Vec::with_capacity(self.sessions.len());
        let (mut total_up, mut total_down) = (0u64, 0u64);
        for entry in self.sessions.iter() {
            let s = entry.value();
            let up = s.bytes_up.load(Ordering::Relaxed);
            let down = s.bytes_down.load(Ordering::Relaxed);
            total_up += up;
            total_down += down;

            let public_host = match (&s.subdomain, &self.config.http_domain) {
                (Some(sub), Some(domain)) => format!("https://{}.{}", sub, domain),
                _ => s
                    .public_port
                    .map(|p| format!("{}:{}", self.config.public_host, p))
                    .unwrap_or_default(),
            };

            tunnels.push(SessionSnapshot {
                name: s.client_id.clone(),
                status: "active",
                protocol: s.protocol.as_str(),
                target: s.target.clone(),
                public_port: s.public_port,
                public_host,
                bytes_up: up,
                bytes_down: down,
                active_connections: s.active_conns.load(Ordering::Relaxed),
                total_connections: s.total_conns.load(Ordering::Relaxed),
            });
        }
        (tunnels, total_up, total_down)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parse_defaults_to_tcp() {
        assert_eq!(Protocol::parse(None), Protocol::Tcp);
        assert_eq!(Protocol::parse(Some("")), Protocol::Tcp);
        assert_eq!(Protocol::parse(Some("TCP")), Protocol::Tcp);
        assert_eq!(Protocol::parse(Some("Udp")), Protocol::Udp);
        assert_eq!(Protocol::parse(Some(" http ")), Protocol::Http);
        assert_eq!(Protocol::parse(Some("quic")), Protocol::Tcp);
    }
}
