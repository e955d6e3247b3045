//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations so recording never takes a ledger or
//! registry lock. Reporting swaps the periodic counters to get a snapshot.
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical counters only.
//! Do NOT use these atomics for coordination or logic decisions.

use crate::domain::LedgerError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

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

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
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
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (count, upper) in buckets.iter().zip(BUCKET_UPPER_BOUNDS) {
        cumulative += count;
        if cumulative >= target {
            return upper;
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Sessions opened (monotonic)
    sessions_opened: AtomicU64,
    /// Sessions closed with a charge (monotonic)
    sessions_closed: AtomicU64,
    /// Ledger operations rejected with Conflict
    conflicts: AtomicU64,
    /// Ledger operations rejected with NotFound
    not_found: AtomicU64,
    /// Ledger operations aborted by storage failure
    transient_errors: AtomicU64,
    /// Ledger operations aborted by an invariant check
    invariant_violations: AtomicU64,
    /// Sum of all charge amounts (minor units)
    charged_amount_total: AtomicU64,
    /// Charges billed at the fallback rate
    fallback_charges: AtomicU64,
    charges_settled: AtomicU64,
    charges_failed: AtomicU64,
    /// Occupancy events handed to the hub
    events_published: AtomicU64,
    /// Per-observer deliveries that succeeded
    events_delivered: AtomicU64,
    observers_registered: AtomicU64,
    /// Observers removed because delivery failed or they fell behind
    observers_dropped: AtomicU64,
    /// Currently registered observers (gauge)
    observers_active: AtomicU64,
    /// Ledger operations since last report (reset on report)
    ops_since_report: AtomicU64,
    /// Sum of ledger op latencies in microseconds (reset on report)
    op_latency_sum_us: AtomicU64,
    /// Max ledger op latency in microseconds (reset on report)
    op_latency_max_us: AtomicU64,
    /// Ledger op latency histogram buckets (reset on report)
    op_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Last report time (only accessed from reporter)
    last_report_time: Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            transient_errors: AtomicU64::new(0),
            invariant_violations: AtomicU64::new(0),
            charged_amount_total: AtomicU64::new(0),
            fallback_charges: AtomicU64::new(0),
            charges_settled: AtomicU64::new(0),
            charges_failed: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            observers_registered: AtomicU64::new(0),
            observers_dropped: AtomicU64::new(0),
            observers_active: AtomicU64::new(0),
            ops_since_report: AtomicU64::new(0),
            op_latency_sum_us: AtomicU64::new(0),
            op_latency_max_us: AtomicU64::new(0),
            op_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    /// Record a ledger operation's latency (lock-free)
    #[inline]
    pub fn record_op_latency(&self, latency_us: u64) {
        self.ops_since_report.fetch_add(1, Ordering::Relaxed);
        self.op_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.op_latency_max_us, latency_us);
        self.op_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_closed(&self, amount: u64, fallback: bool) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        self.charged_amount_total.fetch_add(amount, Ordering::Relaxed);
        if fallback {
            self.fallback_charges.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_settlement(&self, settled: bool) {
        if settled {
            self.charges_settled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.charges_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a rejected ledger operation by error kind
    pub fn record_ledger_error(&self, err: &LedgerError) {
        let counter = match err {
            LedgerError::NotFound { .. } => &self.not_found,
            LedgerError::Conflict(_) => &self.conflicts,
            LedgerError::Transient(_) => &self.transient_errors,
            LedgerError::InvariantViolation(_) => &self.invariant_violations,
            LedgerError::InvalidInput(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_observer_registered(&self) {
        self.observers_registered.fetch_add(1, Ordering::Relaxed);
        self.observers_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an observer leaving the registry; `dropped` marks failure-driven removal
    #[inline]
    pub fn record_observer_removed(&self, dropped: bool) {
        if dropped {
            self.observers_dropped.fetch_add(1, Ordering::Relaxed);
        }
        // Saturating decrement
        let _ = self.observers_active.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    pub fn sessions_closed(&self) -> u64 {
        self.sessions_closed.load(Ordering::Relaxed)
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn events_delivered(&self) -> u64 {
        self.events_delivered.load(Ordering::Relaxed)
    }

    pub fn observers_active(&self) -> u64 {
        self.observers_active.load(Ordering::Relaxed)
    }

    pub fn observers_dropped(&self) -> u64 {
        self.observers_dropped.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let ops_count = self.ops_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.op_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.op_latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.op_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let ops_per_sec = if elapsed.as_secs_f64() > 0.0 {
            ops_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if ops_count > 0 { latency_sum / ops_count } else { 0 };

        MetricsSummary {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations.load(Ordering::Relaxed),
            charged_amount_total: self.charged_amount_total.load(Ordering::Relaxed),
            fallback_charges: self.fallback_charges.load(Ordering::Relaxed),
            charges_settled: self.charges_settled.load(Ordering::Relaxed),
            charges_failed: self.charges_failed.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            observers_registered: self.observers_registered.load(Ordering::Relaxed),
            observers_dropped: self.observers_dropped.load(Ordering::Relaxed),
            observers_active: self.observers_active.load(Ordering::Relaxed),
            ops_per_sec,
            op_latency_avg_us: avg_latency,
            op_latency_max_us: max_latency,
            op_lat_buckets: lat_buckets,
            op_lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            op_lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
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

#[derive(Debug)]
pub struct MetricsSummary {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub conflicts: u64,
    pub not_found: u64,
    pub transient_errors: u64,
    pub invariant_violations: u64,
    pub charged_amount_total: u64,
    pub fallback_charges: u64,
    pub charges_settled: u64,
    pub charges_failed: u64,
    pub events_published: u64,
    pub events_delivered: u64,
    pub observers_registered: u64,
    pub observers_dropped: u64,
    pub observers_active: u64,
    pub ops_per_sec: f64,
    pub op_latency_avg_us: u64,
    pub op_latency_max_us: u64,
    /// Ledger op latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub op_lat_buckets: [u64; NUM_BUCKETS],
    pub op_lat_p50_us: u64,
    pub op_lat_p99_us: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            sessions_opened = %self.sessions_opened,
            sessions_closed = %self.sessions_closed,
            conflicts = %self.conflicts,
            ops_per_sec = format!("{:.1}", self.ops_per_sec),
            avg_latency_us = %self.op_latency_avg_us,
            p99_us = %self.op_lat_p99_us,
            events_published = %self.events_published,
            events_delivered = %self.events_delivered,
            observers_active = %self.observers_active,
            observers_dropped = %self.observers_dropped,
            "metrics"
        );
    }
}
