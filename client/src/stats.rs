//! # Traffic Counters
//!
//! Byte and sub-connection counters shared by the proxy, UDP and HTTP
//! paths, plus the periodic status line that stands in for a full
//! interactive display.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::state::Connection;

/// How often the status line is logged while `--ui` is on.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Cheaply cloneable counter bundle.
#[derive(Clone)]
pub struct Stats {
    inner: Arc<Inner>,
}

struct Inner {
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    active: AtomicI64,
    total: AtomicU64,
    /// Last control RTT in milliseconds, -1 when unknown.
    ping_ms: AtomicI64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                bytes_up: AtomicU64::new(0),
                bytes_down: AtomicU64::new(0),
                active: AtomicI64::new(0),
                total: AtomicU64::new(0),
                ping_ms: AtomicI64::new(-1),
            }),
        }
    }

    pub fn add_up(&self, n: u64) {
        self.inner.bytes_up.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_down(&self, n: u64) {
        self.inner.bytes_down.fetch_add(n, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.inner.active.fetch_add(1, Ordering::Relaxed);
        self.inner.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.inner.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set_ping(&self, rtt: Duration) {
        self.inner
            .ping_ms
            .store(rtt.as_millis() as i64, Ordering::Relaxed);
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.inner.bytes_up.load(Ordering::Relaxed),
            self.inner.bytes_down.load(Ordering::Relaxed),
        )
    }

    pub fn sessions(&self) -> (i64, u64) {
        (
            self.inner.active.load(Ordering::Relaxed),
            self.inner.total.load(Ordering::Relaxed),
        )
    }

    pub fn ping_ms(&self) -> i64 {
        self.inner.ping_ms.load(Ordering::Relaxed)
    }
}

/// Logs a one-line status summary at a fixed cadence.
pub async fn status_loop(conn: Arc<Connection>) {
    let stats = conn.client.stats.clone();
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.tick().await;
    let (mut last_up, mut last_down) = stats.totals();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = conn.shutdown.notified() => return,
        }

        let (up, down) = stats.totals();
        let (active, total) = stats.sessions();
        let up_rate = (up - last_up) / STATUS_INTERVAL.as_secs();
        let down_rate = (down - last_down) / STATUS_INTERVAL.as_secs();
        last_up = up;
        last_down = down;

        let endpoint = conn
            .client
            .public_endpoint()
            .unwrap_or_else(|| "pending".into());
        let ping = match stats.ping_ms() {
            ms if ms >= 0 => format!("{} ms", ms),
            _ => "n/a".into(),
        };
        let udp_status = conn
            .udp_channel()
            .map(|ch| format!(", udp {}", ch.status()))
            .unwrap_or_default();

        info!(
            "{} | up {}/s ({} total) down {}/s ({} total) | sessions {}/{} | ping {}{}",
            endpoint,
            format_bytes(up_rate),
            format_bytes(up),
            format_bytes(down_rate),
            format_bytes(down),
            active,
            total,
            ping,
            udp_status,
        );
    }
}

/// Human-readable byte quantity, e.g. `1.50 MB`.
pub fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut value = n as f64;
    let mut unit = 0;
    while unit < UNITS.len() - 1 && value >= 1024.0 {
        value /= 1024.0;
        unit += 1;
    }
    if value >= 100.0 {
        format!("{:.0} {}", value, UNITS[unit])
    } else if value >= 10.0 {
        format!("{:.1} {}", value, UNITS[unit])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_format_scales() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(1536 * 1024), "1.50 MB");
    }

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new();
        stats.add_up(10);
        stats.add_up(5);
        stats.add_down(7);
        assert_eq!(stats.totals(), (15, 7));

        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        assert_eq!(stats.sessions(), (1, 2));
    }
}
