//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Exponential bucket boundaries for dispatch round-trip latency (µs)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
pub const DISPATCH_BUCKET_BOUNDS: [u64; 10] =
    [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
pub const DISPATCH_NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    DISPATCH_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Lock-free metrics collector for the gate subsystem
pub struct Metrics {
    /// Peripheral lines decoded into events
    events_parsed: AtomicU64,
    /// Events dropped because the fan-in channel was full
    events_dropped: AtomicU64,
    /// Lines with unknown prefixes (logged and ignored)
    lines_ignored: AtomicU64,
    /// Dispatch attempts
    commands_total: AtomicU64,
    /// Dispatch attempts that failed (any taxonomy entry)
    command_failures: AtomicU64,
    /// Dispatch round-trip latency (send to ack), µs
    dispatch_latency_sum_us: AtomicU64,
    dispatch_latency_max_us: AtomicU64,
    dispatch_latency_buckets: [AtomicU64; DISPATCH_NUM_BUCKETS],
    /// Hub deliveries attempted / dropped on full subscriber channels
    hub_delivered: AtomicU64,
    hub_dropped: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_parsed: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            lines_ignored: AtomicU64::new(0),
            commands_total: AtomicU64::new(0),
            command_failures: AtomicU64::new(0),
            dispatch_latency_sum_us: AtomicU64::new(0),
            dispatch_latency_max_us: AtomicU64::new(0),
            dispatch_latency_buckets: Default::default(),
            hub_delivered: AtomicU64::new(0),
            hub_dropped: AtomicU64::new(0),
        }
    }

    pub fn record_event_parsed(&self) {
        self.events_parsed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_line_ignored(&self) {
        self.lines_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self, success: bool) {
        self.commands_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.command_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dispatch_latency(&self, latency_us: u64) {
        self.dispatch_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.dispatch_latency_max_us, latency_us);
        self.dispatch_latency_buckets[bucket_index(latency_us)]
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hub_delivered(&self) {
        self.hub_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hub_dropped(&self) {
        self.hub_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough snapshot for periodic reporting
    pub fn report(&self) -> MetricsSummary {
        let acked: u64 = self.dispatch_latency_buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum();
        let sum_us = self.dispatch_latency_sum_us.load(Ordering::Relaxed);
        MetricsSummary {
            events_parsed: self.events_parsed.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            lines_ignored: self.lines_ignored.load(Ordering::Relaxed),
            commands_total: self.commands_total.load(Ordering::Relaxed),
            command_failures: self.command_failures.load(Ordering::Relaxed),
            dispatch_latency_avg_us: if acked > 0 { sum_us / acked } else { 0 },
            dispatch_latency_max_us: self.dispatch_latency_max_us.load(Ordering::Relaxed),
            hub_delivered: self.hub_delivered.load(Ordering::Relaxed),
            hub_dropped: self.hub_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub events_parsed: u64,
    pub events_dropped: u64,
    pub lines_ignored: u64,
    pub commands_total: u64,
    pub command_failures: u64,
    pub dispatch_latency_avg_us: u64,
    pub dispatch_latency_max_us: u64,
    pub hub_delivered: u64,
    pub hub_dropped: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            events_parsed = %self.events_parsed,
            events_dropped = %self.events_dropped,
            lines_ignored = %self.lines_ignored,
            commands = %self.commands_total,
            command_failures = %self.command_failures,
            dispatch_avg_us = %self.dispatch_latency_avg_us,
            dispatch_max_us = %self.dispatch_latency_max_us,
            hub_delivered = %self.hub_delivered,
            hub_dropped = %self.hub_dropped,
            "metrics_summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(50), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(99999), 10);
    }

    #[test]
    fn test_report_counts() {
        let m = Metrics::new();
        m.record_event_parsed();
        m.record_event_parsed();
        m.record_line_ignored();
        m.record_dispatch(true);
        m.record_dispatch(false);
        m.record_dispatch_latency(200);
        m.record_dispatch_latency(400);

        let summary = m.report();
        assert_eq!(summary.events_parsed, 2);
        assert_eq!(summary.lines_ignored, 1);
        assert_eq!(summary.commands_total, 2);
        assert_eq!(summary.command_failures, 1);
        assert_eq!(summary.dispatch_latency_avg_us, 300);
        assert_eq!(summary.dispatch_latency_max_us, 400);
    }
}
