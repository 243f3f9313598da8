//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics so checkpoint operations never contend on a mutex for
//! bookkeeping. Counters are monotonic; the recognition latency histogram is
//! cumulative so it can be exposed as a Prometheus histogram directly.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only and must not be used for coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Recognition attempt latency bucket boundaries (milliseconds)
/// Buckets: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, >25600
const BUCKET_BOUNDS: [u64; 10] = [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
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
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    passes_registered: AtomicU64,
    codes_verified: AtomicU64,
    /// Verify calls rejected (unknown or already used code)
    verify_rejected: AtomicU64,
    entries_confirmed: AtomicU64,
    exits_confirmed: AtomicU64,
    /// Compare-and-update races lost
    transition_conflicts: AtomicU64,
    /// Entries refused because the plate is already inside
    plate_conflicts: AtomicU64,
    /// Exits refused because no active pass holds the plate
    unknown_plates: AtomicU64,
    /// Ambiguous plate matches (data-integrity faults)
    integrity_faults: AtomicU64,
    /// Registry writes that failed to reach the journal
    store_failures: AtomicU64,
    scans_started: AtomicU64,
    scans_succeeded: AtomicU64,
    scans_exhausted: AtomicU64,
    scans_cancelled: AtomicU64,
    recognition_attempts: AtomicU64,
    /// Attempts that produced no usable plate (miss, error or timeout)
    recognition_failures: AtomicU64,
    /// Recognition attempt latency histogram (cumulative)
    recognition_latency_buckets: [AtomicU64; NUM_BUCKETS],
    recognition_latency_sum_ms: AtomicU64,
    recognition_latency_max_ms: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            passes_registered: AtomicU64::new(0),
            codes_verified: AtomicU64::new(0),
            verify_rejected: AtomicU64::new(0),
            entries_confirmed: AtomicU64::new(0),
            exits_confirmed: AtomicU64::new(0),
            transition_conflicts: AtomicU64::new(0),
            plate_conflicts: AtomicU64::new(0),
            unknown_plates: AtomicU64::new(0),
            integrity_faults: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
            scans_started: AtomicU64::new(0),
            scans_succeeded: AtomicU64::new(0),
            scans_exhausted: AtomicU64::new(0),
            scans_cancelled: AtomicU64::new(0),
            recognition_attempts: AtomicU64::new(0),
            recognition_failures: AtomicU64::new(0),
            recognition_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            recognition_latency_sum_ms: AtomicU64::new(0),
            recognition_latency_max_ms: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_pass_registered(&self) {
        self.passes_registered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_code_verified(&self, accepted: bool) {
        if accepted {
            self.codes_verified.fetch_add(1, Ordering::Relaxed);
        } else {
            self.verify_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_entry_confirmed(&self) {
        self.entries_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_exit_confirmed(&self) {
        self.exits_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transition_conflict(&self) {
        self.transition_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_plate_conflict(&self) {
        self.plate_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unknown_plate(&self) {
        self.unknown_plates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_integrity_fault(&self) {
        self.integrity_faults.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_scan_started(&self) {
        self.scans_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_scan_succeeded(&self) {
        self.scans_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_scan_exhausted(&self) {
        self.scans_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_scan_cancelled(&self) {
        self.scans_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one recognition attempt and its wall-clock latency (lock-free)
    #[inline]
    pub fn record_recognition_attempt(&self, latency_ms: u64, failed: bool) {
        self.recognition_attempts.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.recognition_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.recognition_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.recognition_latency_max_ms, latency_ms);
        self.recognition_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn recognition_attempts(&self) -> u64 {
        self.recognition_attempts.load(Ordering::Relaxed)
    }

    /// Take a consistent-enough snapshot of all counters
    pub fn report(&self) -> MetricsSummary {
        let recognition_latency_buckets = load_buckets(&self.recognition_latency_buckets);
        let latency_count: u64 = recognition_latency_buckets.iter().sum();
        let latency_sum = self.recognition_latency_sum_ms.load(Ordering::Relaxed);
        let recognition_latency_avg_ms =
            if latency_count > 0 { latency_sum / latency_count } else { 0 };

        MetricsSummary {
            passes_registered: self.passes_registered.load(Ordering::Relaxed),
            codes_verified: self.codes_verified.load(Ordering::Relaxed),
            verify_rejected: self.verify_rejected.load(Ordering::Relaxed),
            entries_confirmed: self.entries_confirmed.load(Ordering::Relaxed),
            exits_confirmed: self.exits_confirmed.load(Ordering::Relaxed),
            transition_conflicts: self.transition_conflicts.load(Ordering::Relaxed),
            plate_conflicts: self.plate_conflicts.load(Ordering::Relaxed),
            unknown_plates: self.unknown_plates.load(Ordering::Relaxed),
            integrity_faults: self.integrity_faults.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            scans_started: self.scans_started.load(Ordering::Relaxed),
            scans_succeeded: self.scans_succeeded.load(Ordering::Relaxed),
            scans_exhausted: self.scans_exhausted.load(Ordering::Relaxed),
            scans_cancelled: self.scans_cancelled.load(Ordering::Relaxed),
            recognition_attempts: self.recognition_attempts.load(Ordering::Relaxed),
            recognition_failures: self.recognition_failures.load(Ordering::Relaxed),
            recognition_latency_buckets,
            recognition_latency_sum_ms: latency_sum,
            recognition_latency_avg_ms,
            recognition_latency_max_ms: self.recognition_latency_max_ms.load(Ordering::Relaxed),
            recognition_latency_p50_ms: percentile_from_buckets(&recognition_latency_buckets, 0.50),
            recognition_latency_p99_ms: percentile_from_buckets(&recognition_latency_buckets, 0.99),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub passes_registered: u64,
    pub codes_verified: u64,
    pub verify_rejected: u64,
    pub entries_confirmed: u64,
    pub exits_confirmed: u64,
    pub transition_conflicts: u64,
    pub plate_conflicts: u64,
    pub unknown_plates: u64,
    pub integrity_faults: u64,
    pub store_failures: u64,
    pub scans_started: u64,
    pub scans_succeeded: u64,
    pub scans_exhausted: u64,
    pub scans_cancelled: u64,
    pub recognition_attempts: u64,
    pub recognition_failures: u64,
    /// Recognition attempt latency histogram buckets
    /// Bounds: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, >25600 ms
    pub recognition_latency_buckets: [u64; NUM_BUCKETS],
    pub recognition_latency_sum_ms: u64,
    pub recognition_latency_avg_ms: u64,
    pub recognition_latency_max_ms: u64,
    pub recognition_latency_p50_ms: u64,
    pub recognition_latency_p99_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            registered = %self.passes_registered,
            verified = %self.codes_verified,
            verify_rejected = %self.verify_rejected,
            entries = %self.entries_confirmed,
            exits = %self.exits_confirmed,
            conflicts = %self.transition_conflicts,
            plate_conflicts = %self.plate_conflicts,
            unknown_plates = %self.unknown_plates,
            integrity_faults = %self.integrity_faults,
            scans = %self.scans_started,
            scans_ok = %self.scans_succeeded,
            scans_exhausted = %self.scans_exhausted,
            attempts = %self.recognition_attempts,
            attempt_p99_ms = %self.recognition_latency_p99_ms,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        let summary = metrics.report();
        assert_eq!(summary.passes_registered, 0);
        assert_eq!(summary.recognition_attempts, 0);
        assert_eq!(summary.recognition_latency_avg_ms, 0);
        assert_eq!(summary.recognition_latency_p99_ms, 0);
    }

    #[test]
    fn test_record_verification() {
        let metrics = Metrics::new();
        metrics.record_code_verified(true);
        metrics.record_code_verified(false);
        metrics.record_code_verified(false);

        let summary = metrics.report();
        assert_eq!(summary.codes_verified, 1);
        assert_eq!(summary.verify_rejected, 2);
    }

    #[test]
    fn test_recognition_latency() {
        let metrics = Metrics::new();
        metrics.record_recognition_attempt(40, false);
        metrics.record_recognition_attempt(300, true);
        metrics.record_recognition_attempt(20, false);

        let summary = metrics.report();
        assert_eq!(summary.recognition_attempts, 3);
        assert_eq!(summary.recognition_failures, 1);
        assert_eq!(summary.recognition_latency_avg_ms, 120);
        assert_eq!(summary.recognition_latency_max_ms, 300);
        assert_eq!(summary.recognition_latency_buckets[0], 2);
        assert_eq!(summary.recognition_latency_buckets[3], 1);

        // Histogram is cumulative across reports
        assert_eq!(metrics.report().recognition_attempts, 3);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..500 {
                    m.record_recognition_attempt(i as u64, false);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.recognition_attempts(), 4_000);
        assert_eq!(metrics.report().recognition_latency_max_ms, 499);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(50), 0);
        assert_eq!(bucket_index(51), 1);
        assert_eq!(bucket_index(25600), 9);
        assert_eq!(bucket_index(25601), 10);
    }

    #[test]
    fn test_percentile_from_buckets() {
        let mut buckets = [0u64; NUM_BUCKETS];
        buckets[1] = 90;
        buckets[6] = 10;
        assert_eq!(percentile_from_buckets(&buckets, 0.5), 100);
        assert_eq!(percentile_from_buckets(&buckets, 0.99), 3200);
    }
}
