//! Observability counters for the candle service
//!
//! Plain atomic counters plus a latency window for broadcast calls,
//! exported as a sorted map for Prometheus-style exposition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Core metrics for the candle service.
pub struct ServiceMetrics {
    // Ingestion
    pub deals_applied: AtomicU64,
    pub deals_rejected: AtomicU64,
    pub deals_duplicate: AtomicU64,
    pub deals_filtered: AtomicU64,
    /// Per-resolution skips of deals outside the live bucket
    pub resolutions_skipped: AtomicU64,

    // Store
    pub events_emitted: AtomicU64,
    pub rollovers: AtomicU64,

    // Batching and broadcast
    pub batches_flushed: AtomicU64,
    pub messages_broadcast: AtomicU64,
    pub broadcast_failures: AtomicU64,
    pub broadcast_latency_ns: Mutex<LatencyTracker>,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            deals_applied: AtomicU64::new(0),
            deals_rejected: AtomicU64::new(0),
            deals_duplicate: AtomicU64::new(0),
            deals_filtered: AtomicU64::new(0),
            resolutions_skipped: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
            rollovers: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            messages_broadcast: AtomicU64::new(0),
            broadcast_failures: AtomicU64::new(0),
            broadcast_latency_ns: Mutex::new(LatencyTracker::new(1000)),
        }
    }

    pub fn record_deal_applied(&self, skipped_resolutions: u64) {
        self.deals_applied.fetch_add(1, Ordering::Relaxed);
        self.resolutions_skipped
            .fetch_add(skipped_resolutions, Ordering::Relaxed);
    }

    pub fn record_deal_rejected(&self) {
        self.deals_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deal_duplicate(&self) {
        self.deals_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a record dropped for missing order ids.
    pub fn record_deal_filtered(&self) {
        self.deals_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_events_emitted(&self, count: u64) {
        self.events_emitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rollovers(&self, count: u64) {
        self.rollovers.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_batch_flushed(&self) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful batch publish.
    pub fn record_broadcast(&self, messages: u64, latency_ns: u64) {
        self.messages_broadcast.fetch_add(messages, Ordering::Relaxed);
        if let Ok(mut tracker) = self.broadcast_latency_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    pub fn record_broadcast_failure(&self) {
        self.broadcast_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Export metrics as a BTreeMap for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("deals_applied".to_string(), self.deals_applied.load(Ordering::Relaxed));
        m.insert("deals_rejected".to_string(), self.deals_rejected.load(Ordering::Relaxed));
        m.insert("deals_duplicate".to_string(), self.deals_duplicate.load(Ordering::Relaxed));
        m.insert("deals_filtered".to_string(), self.deals_filtered.load(Ordering::Relaxed));
        m.insert("resolutions_skipped".to_string(), self.resolutions_skipped.load(Ordering::Relaxed));
        m.insert("events_emitted".to_string(), self.events_emitted.load(Ordering::Relaxed));
        m.insert("rollovers".to_string(), self.rollovers.load(Ordering::Relaxed));
        m.insert("batches_flushed".to_string(), self.batches_flushed.load(Ordering::Relaxed));
        m.insert("messages_broadcast".to_string(), self.messages_broadcast.load(Ordering::Relaxed));
        m.insert("broadcast_failures".to_string(), self.broadcast_failures.load(Ordering::Relaxed));
        if let Ok(tracker) = self.broadcast_latency_ns.lock() {
            if let Some(p99) = tracker.percentile(99) {
                m.insert("broadcast_latency_p99_ns".to_string(), p99);
            }
        }
        m
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: Vec<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        let idx = (p.min(100) * (sorted.len() - 1)) / 100;
        Some(sorted[idx])
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}
