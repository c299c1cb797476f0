//! # Public Port Pool
//!
//! Allocates public ports from a fixed range with sticky reservations:
//! when a session ends, its port is remembered against the client's
//! secret key for a grace window, so a reconnecting client that asks for
//! the same port gets it back unless another client grabbed it first.
//! The port itself returns to the free set immediately, so disconnected
//! clients can never wedge the pool.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

/// First public port handed out.
pub const PORT_RANGE_START: u16 = 10_000;
/// Last public port handed out (inclusive).
pub const PORT_RANGE_END: u16 = 20_000;
/// How long a reservation survives the session that created it.
pub const RESERVATION_GRACE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct Reservation {
    port: u16,
    expires_at: Instant,
}

/// The pool proper. All operations run under one mutex held by the
/// caller (`Core::ports`).
pub struct PortPool {
    available: BTreeSet<u16>,
    in_use: HashSet<u16>,
    reservations: HashMap<String, Reservation>,
}

impl PortPool {
    pub fn new() -> Self {
        Self::with_range(PORT_RANGE_START, PORT_RANGE_END)
    }

    pub fn with_range(start: u16, end: u16) -> Self {
        Self {
            available: (start..=end).collect(),
            in_use: HashSet::new(),
            reservations: HashMap::new(),
        }
    }

    /// Acquires a port. A live reservation for `key` naming
    /// `requested_port` wins if that port is still free; otherwise the
    /// lowest free port is handed out. Returns `None` when the pool is
    /// exhausted.
    pub fn acquire(&mut self, key: &str, requested_port: Option<u16>) -> Option<u16> {
        if let Some(requested) = requested_port.filter(|p| *p > 0) {
            if let Some(res) = self.reservations.get(key) {
                if res.port == requested
                    && res.expires_at > Instant::now()
                    && self.available.remove(&requested)
                {
                    self.in_use.insert(requested);
                    self.reservations.remove(key);
                    return Some(requested);
                }
            }
        }

        let port = self.available.pop_first()?;
        self.in_use.insert(port);
        Some(port)
    }

    /// Releases a port at session teardown. Non-empty keys get a sticky
    /// reservation; the port returns to the free set either way.
    pub fn release(&mut self, key: &str, port: u16) {
        if !self.in_use.remove(&port) {
            return;
        }
        if !key.is_empty() {
            self.reservations.insert(
                key.to_string(),
                Reservation {
                    port,
                    expires_at: Instant::now() + RESERVATION_GRACE,
                },
            );
        }
        self.available.insert(port);
    }

    /// Drops expired reservations; returns how many were evicted. Run by
    /// the once-a-minute sweeper.
    pub fn sweep_reservations(&mut self) -> usize {
        let now = Instant::now();
        let before = self.reservations.len();
        self.reservations.retain(|_, res| res.expires_at > now);
        before - self.reservations.len()
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_distinct_and_in_range() {
        let mut pool = PortPool::with_range(10_000, 10_004);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let port = pool.acquire("", None).unwrap();
            assert!((10_000..=10_004).contains(&port));
            assert!(seen.insert(port));
        }
        assert!(pool.acquire("", None).is_none());
    }

    #[test]
    fn lowest_port_first() {
        let mut pool = PortPool::with_range(10_000, 10_010);
        assert_eq!(pool.acquire("", None), Some(10_000));
        assert_eq!(pool.acquire("", None), Some(10_001));
    }

    #[test]
    fn reservation_is_honored_within_grace() {
        let mut pool = PortPool::with_range(10_000, 10_010);
        let port = pool.acquire("key-a", None).unwrap();
        pool.release("key-a", port);

        // Another client registering in between does not steal the port
        // while lower ones are free; the reservation still matches.
        assert_eq!(pool.acquire("key-a", Some(port)), Some(port));
    }

    #[test]
    fn reservation_loses_to_a_racing_claimant() {
        let mut pool = PortPool::with_range(10_000, 10_000);
        let port = pool.acquire("key-a", None).unwrap();
        pool.release("key-a", port);

        // Single-port pool: a new client takes the only port.
        assert_eq!(pool.acquire("key-b", None), Some(port));
        // The original holder's reservation no longer helps.
        assert_eq!(pool.acquire("key-a", Some(port)), None);
    }

    #[test]
    fn requested_port_without_reservation_is_ignored() {
        let mut pool = PortPool::with_range(10_000, 10_010);
        assert_eq!(pool.acquire("key-a", Some(10_005)), Some(10_000));
    }

    #[test]
    fn anonymous_release_leaves_no_reservation() {
        let mut pool = PortPool::with_range(10_000, 10_010);
        let port = pool.acquire("", None).unwrap();
        pool.release("", port);
        assert_eq!(pool.sweep_reservations(), 0);
        assert_eq!(pool.available_count(), 11);
    }

    #[test]
    fn double_release_is_a_noop() {
        let mut pool = PortPool::with_range(10_000, 10_001);
        let port = pool.acquire("k", None).unwrap();
        pool.release("k", port);
        pool.release("k", port);
        assert_eq!(pool.available_count(), 2);
    }
}
