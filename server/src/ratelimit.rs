//! # Per-Source Rate Limiting
//!
//! Three token buckets per source IP (registration, HTTP requests, UDP
//! flow opens) in one garbage-collected map. Records untouched for an
//! hour are evicted by a background sweep every ten minutes.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

/// Inactivity threshold after which a source record is dropped.
pub const RECORD_TTL: Duration = Duration::from_secs(60 * 60);
/// How often the background job sweeps stale records.
pub const GC_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Token buckets for one source address.
pub struct RateBucketRecord {
    /// Registrations: 1 per 12 s (~5/min), burst 10.
    registrations: DefaultDirectRateLimiter,
    /// Public HTTP requests: 100/s, burst 200.
    http_requests: DefaultDirectRateLimiter,
    /// UDP flow opens: 1 per 1.2 s (~50/min), burst 100.
    udp_opens: DefaultDirectRateLimiter,
    last_seen: StdMutex<Instant>,
}

impl RateBucketRecord {
    fn new() -> Self {
        Self {
            registrations: RateLimiter::direct(
                Quota::with_period(Duration::from_secs(12))
                    .unwrap()
                    .allow_burst(NonZeroU32::new(10).unwrap()),
            ),
            http_requests: RateLimiter::direct(
                Quota::per_second(NonZeroU32::new(100).unwrap())
                    .allow_burst(NonZeroU32::new(200).unwrap()),
            ),
            udp_opens: RateLimiter::direct(
                Quota::with_period(Duration::from_millis(1200))
                    .unwrap()
                    .allow_burst(NonZeroU32::new(100).unwrap()),
            ),
            last_seen: StdMutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().unwrap().elapsed()
    }
}

/// The shared per-IP bucket map.
pub struct RateLimiterMap {
    records: DashMap<IpAddr, Arc<RateBucketRecord>>,
}

impl RateLimiterMap {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    fn record(&self, ip: IpAddr) -> Arc<RateBucketRecord> {
        let record = self
            .records
            .entry(ip)
            .or_insert_with(|| Arc::new(RateBucketRecord::new()))
            .clone();
        record.touch();
        record
    }

    /// Whether `ip` may register a new tunnel right now.
    pub fn allow_registration(&self, ip: IpAddr) -> bool {
        self.record(ip).registrations.check().is_ok()
    }

    /// Whether `ip` may issue another public HTTP request right now.
    pub fn allow_http_request(&self, ip: IpAddr) -> bool {
        self.record(ip).http_requests.check().is_ok()
    }

    /// Whether `ip` may open another UDP flow right now.
    pub fn allow_udp_open(&self, ip: IpAddr) -> bool {
        self.record(ip).udp_opens.check().is_ok()
    }

    /// Evicts records idle longer than [`RECORD_TTL`]; returns how many
    /// were dropped.
    pub fn sweep(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.idle_for() < RECORD_TTL);
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([203, 0, 113, last])
    }

    #[test]
    fn registration_burst_is_bounded() {
        let map = RateLimiterMap::new();
        // Burst of 10 passes, the 11th immediate attempt is rejected.
        for _ in 0..10 {
            assert!(map.allow_registration(ip(1)));
        }
        assert!(!map.allow_registration(ip(1)));
    }

    #[test]
    fn sources_are_isolated() {
        let map = RateLimiterMap::new();
        for _ in 0..10 {
            assert!(map.allow_registration(ip(2)));
        }
        assert!(!map.allow_registration(ip(2)));
        assert!(map.allow_registration(ip(3)));
    }

    #[test]
    fn buckets_are_independent_per_source() {
        let map = RateLimiterMap::new();
        for _ in 0..10 {
            assert!(map.allow_registration(ip(4)));
        }
        assert!(!map.allow_registration(ip(4)));
        // Exhausting registrations does not consume HTTP or UDP tokens.
        assert!(map.allow_http_request(ip(4)));
        assert!(map.allow_udp_open(ip(4)));
    }

    #[test]
    fn sweep_keeps_fresh_records() {
        let map = RateLimiterMap::new();
        map.allow_registration(ip(5));
        assert_eq!(map.sweep(), 0);
        assert_eq!(map.len(), 1);
    }
}
