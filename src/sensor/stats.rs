//! Lock-free sensor metrics counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for everything the dispatch path can do with a sample.
///
/// All counters are relaxed atomics; `snapshot()` reads them without
/// resetting, making it suitable both for assertions and for the periodic
/// reporter task.
#[derive(Default)]
pub struct Metrics {
    events: AtomicU64,
    subscriptions: AtomicU64,
    sample_errors: AtomicU64,
    decode_errors: AtomicU64,
    filter_errors: AtomicU64,
    backpressure_drops: AtomicU64,
}

/// Point-in-time view of the sensor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Total events stamped by this sensor.
    pub events: u64,
    /// Currently active subscriptions.
    pub subscriptions: u64,
    /// Samples that arrived with a monitor-side error attached.
    pub sample_errors: u64,
    /// Samples dropped because decoding failed.
    pub decode_errors: u64,
    /// Filter evaluations that failed and skipped a subscriber.
    pub filter_errors: u64,
    /// Events dropped on full subscriber channels.
    pub backpressure_drops: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_subscription(&self) {
        self.subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_subscription(&self) {
        self.subscriptions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_sample_error(&self) {
        self.sample_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filter_error(&self) {
        self.filter_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure_drop(&self) {
        self.backpressure_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            sample_errors: self.sample_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            filter_errors: self.filter_errors.load(Ordering::Relaxed),
            backpressure_drops: self.backpressure_drops.load(Ordering::Relaxed),
        }
    }
}
