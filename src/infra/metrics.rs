//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
pub const METRICS_NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
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

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// One hardware operation family: counters plus a latency histogram
struct OpStats {
    total: AtomicU64,
    failures: AtomicU64,
    latency_sum_us: AtomicU64,
    latency_max_us: AtomicU64,
    buckets: [AtomicU64; METRICS_NUM_BUCKETS],
}

impl OpStats {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn record(&self, latency_us: u64, ok: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
        self.buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> OpSummary {
        let total = self.total.load(Ordering::Relaxed);
        let sum = self.latency_sum_us.load(Ordering::Relaxed);
        OpSummary {
            total,
            failures: self.failures.load(Ordering::Relaxed),
            avg_latency_us: if total > 0 { sum / total } else { 0 },
            max_latency_us: self.latency_max_us.load(Ordering::Relaxed),
            buckets: load_buckets(&self.buckets),
        }
    }
}

/// Snapshot of one operation family
#[derive(Debug, Clone)]
pub struct OpSummary {
    pub total: u64,
    pub failures: u64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
    pub buckets: [u64; METRICS_NUM_BUCKETS],
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
pub struct Metrics {
    started_at: Instant,
    // Session lifecycle counters (monotonic)
    entries_ok: AtomicU64,
    entries_rejected: AtomicU64,
    completions: AtomicU64,
    cancellations: AtomicU64,
    // Hardware operation families
    capture: OpStats,
    actuation: OpStats,
    print: OpStats,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            entries_ok: AtomicU64::new(0),
            entries_rejected: AtomicU64::new(0),
            completions: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            capture: OpStats::new(),
            actuation: OpStats::new(),
            print: OpStats::new(),
        }
    }

    pub fn record_entry_ok(&self) {
        self.entries_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_entry_rejected(&self) {
        self.entries_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture(&self, latency_us: u64, ok: bool) {
        self.capture.record(latency_us, ok);
    }

    pub fn record_actuation(&self, latency_us: u64, ok: bool) {
        self.actuation.record(latency_us, ok);
    }

    pub fn record_print(&self, latency_us: u64, ok: bool) {
        self.print.record(latency_us, ok);
    }

    /// Build a consistent snapshot. Occupancy comes from the store, so the
    /// caller passes it in.
    pub fn report(&self, occupied: usize, total_spaces: usize) -> MetricsSummary {
        MetricsSummary {
            uptime_secs: self.started_at.elapsed().as_secs(),
            entries_ok: self.entries_ok.load(Ordering::Relaxed),
            entries_rejected: self.entries_rejected.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            occupied,
            total_spaces,
            capture: self.capture.summary(),
            actuation: self.actuation.summary(),
            print: self.print.summary(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic snapshot for logging and the Prometheus endpoint
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub uptime_secs: u64,
    pub entries_ok: u64,
    pub entries_rejected: u64,
    pub completions: u64,
    pub cancellations: u64,
    pub occupied: usize,
    pub total_spaces: usize,
    pub capture: OpSummary,
    pub actuation: OpSummary,
    pub print: OpSummary,
}

impl MetricsSummary {
    /// Log the summary as a single structured line
    pub fn log(&self) {
        info!(
            uptime_secs = %self.uptime_secs,
            entries_ok = %self.entries_ok,
            entries_rejected = %self.entries_rejected,
            completions = %self.completions,
            cancellations = %self.cancellations,
            occupied = %self.occupied,
            total_spaces = %self.total_spaces,
            capture_total = %self.capture.total,
            capture_failures = %self.capture.failures,
            capture_avg_us = %self.capture.avg_latency_us,
            actuation_total = %self.actuation.total,
            actuation_failures = %self.actuation.failures,
            actuation_avg_us = %self.actuation.avg_latency_us,
            actuation_max_us = %self.actuation.max_latency_us,
            print_total = %self.print.total,
            print_failures = %self.print.failures,
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
    fn test_op_stats_record() {
        let metrics = Metrics::new();
        metrics.record_capture(150, true);
        metrics.record_capture(90, true);
        metrics.record_capture(70000, false);

        let summary = metrics.report(0, 0);
        assert_eq!(summary.capture.total, 3);
        assert_eq!(summary.capture.failures, 1);
        assert_eq!(summary.capture.max_latency_us, 70000);
        assert_eq!(summary.capture.buckets[0], 1); // 90
        assert_eq!(summary.capture.buckets[1], 1); // 150
        assert_eq!(summary.capture.buckets[10], 1); // 70000
    }

    #[test]
    fn test_session_counters() {
        let metrics = Metrics::new();
        metrics.record_entry_ok();
        metrics.record_entry_ok();
        metrics.record_entry_rejected();
        metrics.record_completed();
        metrics.record_cancelled();

        let summary = metrics.report(3, 10);
        assert_eq!(summary.entries_ok, 2);
        assert_eq!(summary.entries_rejected, 1);
        assert_eq!(summary.completions, 1);
        assert_eq!(summary.cancellations, 1);
        assert_eq!(summary.occupied, 3);
        assert_eq!(summary.total_spaces, 10);
    }

    #[test]
    fn test_update_atomic_max() {
        let max = AtomicU64::new(10);
        update_atomic_max(&max, 5);
        assert_eq!(max.load(Ordering::Relaxed), 10);
        update_atomic_max(&max, 20);
        assert_eq!(max.load(Ordering::Relaxed), 20);
    }
}
