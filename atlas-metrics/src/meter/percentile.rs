//! Percentile-capable meters.
//!
//! Samples are mapped onto a fixed table of exponentially spaced bucket
//! boundaries; each meter publishes one counter per occupied bucket so the
//! backend can estimate arbitrary percentiles across instances. The table
//! is deterministic and does not depend on observed data.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::{Lazy, OnceCell};

use crate::id::Id;
use crate::meter::{Counter, DistributionSummary, Statistic, Timer, STATISTIC};
use crate::registry::Registry;

/// Bucket boundaries: 1, 2, 3, then roughly three values per factor of
/// four, ending at `u64::MAX`.
static BUCKET_VALUES: Lazy<Vec<u64>> = Lazy::new(|| {
    let mut values = vec![1u64, 2, 3];
    let mut exp = 2u32;
    while exp < 64 {
        let current = 1u64 << exp;
        let delta = current / 3;
        let next = if exp + 2 < 64 {
            (1u64 << (exp + 2)) - delta
        } else {
            u64::MAX
        };
        let mut v = current;
        while v < next {
            values.push(v);
            match v.checked_add(delta) {
                Some(n) => v = n,
                None => break,
            }
        }
        exp += 2;
    }
    values.push(u64::MAX);
    values
});

/// Fixed bucket table shared by all percentile meters.
#[derive(Debug)]
pub struct PercentileBuckets;

impl PercentileBuckets {
    /// Number of buckets.
    pub fn length() -> usize {
        BUCKET_VALUES.len()
    }

    /// Upper bound of bucket `i`.
    pub fn get(i: usize) -> u64 {
        BUCKET_VALUES[i]
    }

    /// Index of the bucket whose upper bound is the smallest value greater
    /// than or equal to `v`.
    pub fn index_of(v: u64) -> usize {
        BUCKET_VALUES.partition_point(|b| *b < v)
    }

    /// Upper bound of the bucket that `v` falls into.
    pub fn bucket(v: u64) -> u64 {
        BUCKET_VALUES[Self::index_of(v)]
    }

    /// Estimate a percentile from a full set of bucket counts. `counts`
    /// must have [`PercentileBuckets::length`] entries. Returns NaN when
    /// the counts are all zero.
    pub fn percentile(counts: &[u64], p: f64) -> f64 {
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return f64::NAN;
        }
        let threshold = p / 100.0 * total as f64;
        let mut acc = 0.0;
        for (i, &c) in counts.iter().enumerate() {
            if c == 0 {
                continue;
            }
            let prev = acc;
            acc += c as f64;
            if acc >= threshold {
                let base = if i == 0 {
                    0.0
                } else {
                    BUCKET_VALUES[i - 1] as f64
                };
                let next = BUCKET_VALUES[i] as f64;
                let frac = ((threshold - prev) / c as f64).clamp(0.0, 1.0);
                return base + (next - base) * frac;
            }
        }
        BUCKET_VALUES[BUCKET_VALUES.len() - 1] as f64
    }

    /// Estimate several percentiles in one pass over the counts.
    pub fn percentiles(counts: &[u64], pcts: &[f64], results: &mut [f64]) {
        for (p, out) in pcts.iter().zip(results.iter_mut()) {
            *out = Self::percentile(counts, *p);
        }
    }
}

/// Lazily-created per-bucket counters for one percentile meter. Shared via
/// the registry state map so repeated lookups bind to the same cells.
struct BucketCounters {
    registry: Registry,
    id: Id,
    // T for timers, D for distribution summaries
    prefix: char,
    cells: Vec<OnceCell<Counter>>,
}

impl BucketCounters {
    fn new(registry: Registry, id: Id, prefix: char) -> Self {
        let mut cells = Vec::with_capacity(PercentileBuckets::length());
        cells.resize_with(PercentileBuckets::length(), OnceCell::new);
        BucketCounters {
            registry,
            id,
            prefix,
            cells,
        }
    }

    fn counter_for(&self, i: usize) -> &Counter {
        self.cells[i].get_or_init(|| {
            let label = format!("{}{:04X}", self.prefix, i);
            self.registry.counter(
                self.id
                    .with_tag(STATISTIC, Statistic::Percentile.as_str())
                    .with_tag("percentile", label),
            )
        })
    }

    fn counts(&self) -> Vec<u64> {
        self.cells
            .iter()
            .map(|c| c.get().map(|c| c.actual_count() as u64).unwrap_or(0))
            .collect()
    }
}

/// Timer that also publishes per-bucket percentile counters.
#[derive(Clone)]
pub struct PercentileTimer {
    timer: Timer,
    counters: Arc<BucketCounters>,
}

impl PercentileTimer {
    /// Get or create the percentile timer for `id`. The base timer is
    /// registered normally; bucket counters are created on first use.
    pub fn get(registry: &Registry, id: Id) -> Self {
        let timer = registry.timer(id.clone());
        let counters = registry.state_get_or_init(&id, || {
            Arc::new(BucketCounters::new(registry.clone(), id.clone(), 'T'))
        });
        PercentileTimer { timer, counters }
    }

    /// Record a single duration.
    pub fn record(&self, duration: Duration) {
        self.timer.record(duration);
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.counters
            .counter_for(PercentileBuckets::index_of(nanos))
            .increment();
    }

    /// Time a closure and record its elapsed monotonic time.
    pub fn time<R>(&self, f: impl FnOnce() -> R) -> R {
        let clock = self.counters.registry.clock();
        let start = clock.monotonic_time();
        let result = f();
        let elapsed = clock.monotonic_time().saturating_sub(start);
        self.record(Duration::from_nanos(elapsed));
        result
    }

    /// Estimate a percentile in seconds from the current step's data.
    pub fn percentile(&self, p: f64) -> f64 {
        PercentileBuckets::percentile(&self.counters.counts(), p) / 1e9
    }

    /// The underlying timer.
    pub fn timer(&self) -> &Timer {
        &self.timer
    }
}

impl std::fmt::Debug for PercentileTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PercentileTimer")
            .field("id", &self.counters.id)
            .finish()
    }
}

/// Distribution summary that also publishes per-bucket percentile counters.
#[derive(Clone)]
pub struct PercentileDistributionSummary {
    summary: DistributionSummary,
    counters: Arc<BucketCounters>,
}

impl PercentileDistributionSummary {
    /// Get or create the percentile distribution summary for `id`.
    pub fn get(registry: &Registry, id: Id) -> Self {
        let summary = registry.distribution_summary(id.clone());
        let counters = registry.state_get_or_init(&id, || {
            Arc::new(BucketCounters::new(registry.clone(), id.clone(), 'D'))
        });
        PercentileDistributionSummary { summary, counters }
    }

    /// Record a single amount.
    pub fn record(&self, amount: u64) {
        self.summary.record(amount);
        self.counters
            .counter_for(PercentileBuckets::index_of(amount))
            .increment();
    }

    /// Estimate a percentile from the current step's data.
    pub fn percentile(&self, p: f64) -> f64 {
        PercentileBuckets::percentile(&self.counters.counts(), p)
    }

    /// The underlying distribution summary.
    pub fn summary(&self) -> &DistributionSummary {
        &self.summary
    }
}

impl std::fmt::Debug for PercentileDistributionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PercentileDistributionSummary")
            .field("id", &self.counters.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::Registry;

    #[test]
    fn bucket_values_are_strictly_increasing() {
        let values = &*BUCKET_VALUES;
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*values.first().unwrap(), 1);
        assert_eq!(*values.last().unwrap(), u64::MAX);
    }

    #[test]
    fn index_of_finds_smallest_upper_bound() {
        assert_eq!(PercentileBuckets::index_of(0), 0);
        assert_eq!(PercentileBuckets::index_of(1), 0);
        assert_eq!(PercentileBuckets::index_of(2), 1);
        assert_eq!(PercentileBuckets::index_of(4), 3);
        let i = PercentileBuckets::index_of(100);
        assert!(PercentileBuckets::get(i) >= 100);
        assert!(PercentileBuckets::get(i - 1) < 100);
    }

    #[test]
    fn percentile_of_empty_counts_is_nan() {
        let counts = vec![0u64; PercentileBuckets::length()];
        assert!(PercentileBuckets::percentile(&counts, 50.0).is_nan());
    }

    #[test]
    fn percentile_estimate_within_bucket_bounds() {
        let mut counts = vec![0u64; PercentileBuckets::length()];
        // 100 samples of value 100
        counts[PercentileBuckets::index_of(100)] = 100;
        let p50 = PercentileBuckets::percentile(&counts, 50.0);
        let i = PercentileBuckets::index_of(100);
        let hi = PercentileBuckets::get(i) as f64;
        let lo = PercentileBuckets::get(i - 1) as f64;
        assert!(p50 > lo && p50 <= hi, "p50={p50} not in ({lo}, {hi}]");
    }

    #[test]
    fn timer_records_into_buckets() {
        let clock = Arc::new(ManualClock::new());
        let registry = Registry::builder().with_clock(clock.clone()).build();
        let t = PercentileTimer::get(&registry, Id::new("latency"));
        for ms in [10u64, 20, 30, 40] {
            t.record(Duration::from_millis(ms));
        }
        let p = t.percentile(50.0);
        assert!(p > 0.0 && p < 0.1, "p50={p}");
        // repeated lookups share the same bucket counters
        let t2 = PercentileTimer::get(&registry, Id::new("latency"));
        t2.record(Duration::from_millis(10));
        assert_eq!(t2.timer().actual_count(), 5);
    }
}
