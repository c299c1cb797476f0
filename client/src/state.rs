//! # Client State
//!
//! Contains the state types for the tunnel client:
//! - [`ClientConfig`] — resolved CLI configuration
//! - [`Client`] — identity and counters that survive reconnects
//! - [`Connection`] — one live control connection and its writer
//!
//! The [`Client`] outlives individual control connections so the session
//! key, sticky port and UDP secret carry across reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use tunnel_protocol::codec::{CodecError, FrameWriter};
use tunnel_protocol::crypto::SECRET_LEN;
use tunnel_protocol::message::ControlMessage;

use crate::stats::Stats;
use crate::udp::UdpChannel;

/// A TLS stream to the server (control channel or back-channel).
pub type ServerStream = TlsStream<TcpStream>;

/// How long the client gives a forwarded local HTTP request.
const HTTP_FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolved command-line configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    /// Local backend as `host:port`.
    pub local_addr: String,
    /// Whether the backend is loopback (drives the Host rewrite).
    pub local_is_loopback: bool,
    pub client_id: String,
    /// `tcp`, `udp` or `http`.
    pub protocol: String,
    pub cert_pin: Option<String>,
    pub ui: bool,
}

/// Identity assigned by the server, kept across reconnects.
#[derive(Debug, Default, Clone)]
struct Registration {
    key: Option<String>,
    remote_port: Option<u16>,
    subdomain: Option<String>,
    base_domain: Option<String>,
    udp_secret: Option<[u8; SECRET_LEN]>,
}

/// The long-lived client: configuration, TLS connector, the local HTTP
/// forwarder and everything the server has assigned us so far.
pub struct Client {
    pub config: ClientConfig,
    pub connector: TlsConnector,
    pub http: reqwest::Client,
    pub stats: Stats,
    registration: StdMutex<Registration>,
    registered: AtomicBool,
}

impl Client {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let connector = crate::tls::build_connector(config.cert_pin.as_deref())?;
        // Loopback backends commonly run self-signed HTTPS; traffic never
        // leaves the machine, so verification is skipped.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(HTTP_FORWARD_TIMEOUT)
            .build()?;
        Ok(Self {
            config,
            connector,
            http,
            stats: Stats::new(),
            registration: StdMutex::new(Registration::default()),
            registered: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> Option<String> {
        self.registration.lock().unwrap().key.clone()
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.registration.lock().unwrap().remote_port
    }

    pub fn subdomain(&self) -> Option<String> {
        self.registration.lock().unwrap().subdomain.clone()
    }

    pub fn base_domain(&self) -> Option<String> {
        self.registration.lock().unwrap().base_domain.clone()
    }

    pub fn udp_secret(&self) -> Option<[u8; SECRET_LEN]> {
        self.registration.lock().unwrap().udp_secret
    }

    /// Records a successful `registered` reply.
    pub fn store_registration(
        &self,
        key: String,
        remote_port: u16,
        subdomain: Option<String>,
        base_domain: Option<String>,
        udp_secret: Option<[u8; SECRET_LEN]>,
    ) {
        let mut reg = self.registration.lock().unwrap();
        reg.key = Some(key);
        reg.remote_port = Some(remote_port);
        reg.subdomain = subdomain;
        reg.base_domain = base_domain;
        reg.udp_secret = udp_secret;
        self.registered.store(true, Ordering::Release);
    }

    /// Reads and clears the registered-this-attempt flag; the reconnect
    /// loop uses it to reset its backoff.
    pub fn take_registered(&self) -> bool {
        self.registered.swap(false, Ordering::AcqRel)
    }

    /// The public endpoint to display, e.g. `https://ab12cd.example.test`
    /// or `1.2.3.4:10000`.
    pub fn public_endpoint(&self) -> Option<String> {
        let reg = self.registration.lock().unwrap();
        if let (Some(sub), Some(domain)) = (&reg.subdomain, &reg.base_domain) {
            return Some(format!("https://{}.{}", sub, domain));
        }
        let port = reg.remote_port?;
        let host = self
            .config
            .server_addr
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(self.config.server_addr.as_str());
        Some(format!("{}:{}", host, port))
    }
}

/// One live control connection. Tasks spawned for this connection hold
/// an `Arc<Connection>` and select on [`Connection::shutdown`].
pub struct Connection {
    pub client: Arc<Client>,
    writer: Mutex<FrameWriter<WriteHalf<ServerStream>>>,
    pub shutdown: Notify,
    closed: AtomicBool,
    ping_sent: StdMutex<Option<Instant>>,
    pub udp: StdMutex<Option<Arc<UdpChannel>>>,
    warned_unknown: AtomicBool,
}

impl Connection {
    pub fn new(client: Arc<Client>, writer: FrameWriter<WriteHalf<ServerStream>>) -> Self {
        Self {
            client,
            writer: Mutex::new(writer),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
            ping_sent: StdMutex::new(None),
            udp: StdMutex::new(None),
            warned_unknown: AtomicBool::new(false),
        }
    }

    /// Writes one frame on the control channel; the mutex serializes
    /// concurrent producers.
    pub async fn send(&self, msg: &ControlMessage) -> Result<(), CodecError> {
        self.writer.lock().await.write_frame(msg).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tears the connection down: wakes selecting tasks and closes the
    /// UDP channel with all its flows. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_waiters();
        if let Some(channel) = self.udp.lock().unwrap().take() {
            channel.close();
        }
    }

    pub fn mark_ping_sent(&self) {
        *self.ping_sent.lock().unwrap() = Some(Instant::now());
    }

    /// Computes the RTT for a received `pong`, if a ping was pending.
    pub fn record_pong(&self) -> Option<Duration> {
        let sent = self.ping_sent.lock().unwrap().take()?;
        let rtt = sent.elapsed();
        self.client.stats.set_ping(rtt);
        Some(rtt)
    }

    pub fn udp_channel(&self) -> Option<Arc<UdpChannel>> {
        self.udp.lock().unwrap().clone()
    }

    /// Returns true the first time an unknown control message shows up
    /// on this connection.
    pub fn warn_unknown_once(&self) -> bool {
        !self.warned_unknown.swap(true, Ordering::Relaxed)
    }
}
