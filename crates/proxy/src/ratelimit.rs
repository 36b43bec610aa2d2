//! Per-client UDP rate limiting.
//!
//! One token bucket per source IP, capacity and refill rate both equal to
//! the configured queries-per-second. Only UDP traffic is checked: it is the
//! one transport cheap enough to spoof and amplify. Idle buckets age out
//! after an hour.

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

type Bucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const IDLE_EXPIRY: Duration = Duration::from_secs(3600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

struct BucketEntry {
    bucket: Bucket,
    last_seen: Mutex<Instant>,
}

impl BucketEntry {
    fn new(quota: Quota) -> Self {
        Self {
            bucket: RateLimiter::direct(quota),
            last_seen: Mutex::new(Instant::now()),
        }
    }
}

pub struct UdpRateLimiter {
    buckets: DashMap<IpAddr, BucketEntry>,
    quota: Option<Quota>,
    whitelist: Vec<IpAddr>,
    last_sweep: Mutex<Instant>,
}

impl UdpRateLimiter {
    /// `rps == 0` builds a disabled limiter that always allows.
    pub fn new(rps: u32, whitelist: Vec<IpAddr>) -> Self {
        let quota = NonZeroU32::new(rps).map(Quota::per_second);
        Self {
            buckets: DashMap::new(),
            quota,
            whitelist,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.quota.is_some()
    }

    /// Consumes one token for `ip` if available. Whitelisted addresses and
    /// disabled limiters always pass.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let Some(quota) = self.quota else {
            return true;
        };
        if self.whitelist.contains(&ip) {
            return true;
        }
        self.maybe_sweep();

        let entry = self.buckets.entry(ip).or_insert_with(|| BucketEntry::new(quota));
        *entry.last_seen.lock().unwrap() = Instant::now();
        entry.bucket.check().is_ok()
    }

    /// Drops buckets that have been idle longer than `max_age`; returns how
    /// many were removed.
    pub fn evict_idle(&self, max_age: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, entry| entry.last_seen.lock().unwrap().elapsed() <= max_age);
        let removed = before - self.buckets.len();
        if removed > 0 {
            debug!(removed, "evicted idle rate limiter buckets");
        }
        removed
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }

    fn maybe_sweep(&self) {
        {
            let mut last = self.last_sweep.lock().unwrap();
            if last.elapsed() < SWEEP_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        self.evict_idle(IDLE_EXPIRY);
    }
}
