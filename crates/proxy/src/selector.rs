//! RTT-weighted upstream selection.
//!
//! Every exchange feeds its round-trip time back into a per-upstream running
//! average (`(old + new) / 2`); failures count as the default timeout so a
//! dead upstream drifts to low weight without ever reaching zero. Selection
//! draws an index with probability proportional to `sum(rtt) - rtt[i]`,
//! clamped to at least 1 — a failing upstream must keep nonzero probability
//! or its recovery would never be observed.

use crate::upstream::Upstream;
use corten_dns_domain::DEFAULT_TIMEOUT_MS;
use std::sync::{Arc, Mutex};

/// RTT substituted for a failed exchange.
pub const FAILED_EXCHANGE_RTT_MS: u64 = DEFAULT_TIMEOUT_MS;

struct SelectorStats {
    /// Running RTT average in milliseconds; 0 means "no sample yet".
    rtt: Vec<u64>,
    weight: Vec<u64>,
}

pub struct UpstreamSelector {
    upstreams: Vec<Arc<dyn Upstream>>,
    stats: Mutex<SelectorStats>,
}

impl UpstreamSelector {
    pub fn new(upstreams: Vec<Arc<dyn Upstream>>) -> Self {
        let n = upstreams.len();
        Self {
            upstreams,
            stats: Mutex::new(SelectorStats {
                rtt: vec![0; n],
                weight: vec![1; n],
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    /// Picks an upstream by weighted random choice. The lock is held only to
    /// snapshot the weights; concurrent `record` calls cannot invalidate the
    /// selection.
    pub fn choose(&self) -> (Arc<dyn Upstream>, usize) {
        if self.upstreams.len() == 1 {
            return (Arc::clone(&self.upstreams[0]), 0);
        }
        let weights = self.stats.lock().unwrap().weight.clone();
        let index = weighted_index(&weights);
        (Arc::clone(&self.upstreams[index]), index)
    }

    /// Feeds one measured exchange into the stats. Both vectors are updated
    /// together under the one lock.
    pub fn record(&self, index: usize, measured_ms: u64) {
        let mut stats = self.stats.lock().unwrap();

        let current = stats.rtt[index];
        stats.rtt[index] = if current == 0 {
            measured_ms
        } else {
            (current + measured_ms) / 2
        };

        let sum: u64 = stats.rtt.iter().sum();
        for i in 0..stats.weight.len() {
            stats.weight[i] = (sum - stats.rtt[i]).max(1);
        }
    }

    pub fn record_failure(&self, index: usize) {
        self.record(index, FAILED_EXCHANGE_RTT_MS);
    }

    /// Snapshot of `(rtt, weight)` for observability and tests.
    pub fn stats_snapshot(&self) -> (Vec<u64>, Vec<u64>) {
        let stats = self.stats.lock().unwrap();
        (stats.rtt.clone(), stats.weight.clone())
    }
}

fn weighted_index(weights: &[u64]) -> usize {
    let total: u64 = weights.iter().sum();
    let mut draw = fastrand::u64(0..total);
    for (index, weight) in weights.iter().enumerate() {
        if draw < *weight {
            return index;
        }
        draw -= *weight;
    }
    weights.len() - 1
}
