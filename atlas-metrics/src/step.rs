//! Step-bucketed accumulators.
//!
//! A step value holds a current bucket being written and the previous,
//! completed bucket that gets reported. On the first operation whose
//! timestamp falls into a later bucket, the current value moves to previous
//! and the current bucket resets. When more than one step boundary was
//! crossed the previous bucket is stale and resets to the identity instead,
//! so an old value is never reported as current.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::atomic::AtomicF64;

/// Wall timestamp of the start of the bucket containing `t`.
pub fn step_boundary(t: u64, step: u64) -> u64 {
    t / step * step
}

/// Step-bucketed `i64` accumulator.
#[derive(Debug)]
pub struct StepLong {
    init: i64,
    step: u64,
    current: AtomicI64,
    previous: AtomicI64,
    last_init: AtomicU64,
}

impl StepLong {
    /// Create with the given identity value and step size in milliseconds.
    pub fn new(init: i64, step: u64) -> Self {
        StepLong {
            init,
            step,
            current: AtomicI64::new(init),
            previous: AtomicI64::new(init),
            last_init: AtomicU64::new(0),
        }
    }

    /// Step size in milliseconds.
    pub fn step(&self) -> u64 {
        self.step
    }

    fn roll(&self, now: u64) {
        let step_num = now / self.step;
        let last = self.last_init.load(Ordering::Acquire);
        if last < step_num
            && self
                .last_init
                .compare_exchange(last, step_num, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let v = self.current.swap(self.init, Ordering::AcqRel);
            // A gap of more than one step means the bucket is stale.
            let p = if last == step_num - 1 { v } else { self.init };
            self.previous.store(p, Ordering::Release);
        }
    }

    /// Add to the bucket containing `now`.
    pub fn add(&self, now: u64, amount: i64) {
        self.roll(now);
        self.current.fetch_add(amount, Ordering::AcqRel);
    }

    /// Raise the bucket containing `now` to at least `value`.
    pub fn max(&self, now: u64, value: i64) {
        self.roll(now);
        self.current.fetch_max(value, Ordering::AcqRel);
    }

    /// Value accumulated so far in the bucket containing `now`.
    pub fn current(&self, now: u64) -> i64 {
        self.roll(now);
        self.current.load(Ordering::Acquire)
    }

    /// Value of the bucket completed at the last boundary before or at `now`.
    pub fn poll(&self, now: u64) -> i64 {
        self.roll(now);
        self.previous.load(Ordering::Acquire)
    }

    /// Completed bucket expressed as a per-second rate.
    pub fn poll_as_rate(&self, now: u64) -> f64 {
        self.poll(now) as f64 / (self.step as f64 / 1000.0)
    }
}

/// Step-bucketed `f64` accumulator. The identity is configurable: `0.0` for
/// totals and `NaN` for max-style buckets.
pub struct StepDouble {
    init: f64,
    step: u64,
    current: AtomicF64,
    previous: AtomicF64,
    last_init: AtomicU64,
}

impl StepDouble {
    /// Create with the given identity value and step size in milliseconds.
    pub fn new(init: f64, step: u64) -> Self {
        StepDouble {
            init,
            step,
            current: AtomicF64::new(init),
            previous: AtomicF64::new(init),
            last_init: AtomicU64::new(0),
        }
    }

    /// Step size in milliseconds.
    pub fn step(&self) -> u64 {
        self.step
    }

    fn roll(&self, now: u64) {
        let step_num = now / self.step;
        let last = self.last_init.load(Ordering::Acquire);
        if last < step_num
            && self
                .last_init
                .compare_exchange(last, step_num, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let v = self.current.get_and_set(self.init);
            let p = if last == step_num - 1 { v } else { self.init };
            self.previous.set(p);
        }
    }

    /// Add to the bucket containing `now`.
    pub fn add(&self, now: u64, amount: f64) {
        self.roll(now);
        self.current.add_and_get(amount);
    }

    /// Raise the bucket containing `now` to at least `value`. NaN handling
    /// follows [`AtomicF64::max`].
    pub fn max(&self, now: u64, value: f64) {
        self.roll(now);
        self.current.max(value);
    }

    /// Value accumulated so far in the bucket containing `now`.
    pub fn current(&self, now: u64) -> f64 {
        self.roll(now);
        self.current.get()
    }

    /// Value of the bucket completed at the last boundary before or at `now`.
    pub fn poll(&self, now: u64) -> f64 {
        self.roll(now);
        self.previous.get()
    }

    /// Completed bucket expressed as a per-second rate.
    pub fn poll_as_rate(&self, now: u64) -> f64 {
        self.poll(now) / (self.step as f64 / 1000.0)
    }
}

impl fmt::Debug for StepDouble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDouble")
            .field("step", &self.step)
            .field("current", &self.current)
            .field("previous", &self.previous)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: u64 = 10_000;

    #[test]
    fn poll_returns_completed_bucket() {
        let v = StepDouble::new(0.0, STEP);
        v.add(5_000, 1.0);
        assert_eq!(v.poll(5_000), 0.0);
        assert_eq!(v.poll(10_000), 1.0);
    }

    #[test]
    fn empty_step_polls_zero() {
        let v = StepDouble::new(0.0, STEP);
        v.add(5_000, 1.0);
        assert_eq!(v.poll(10_000), 1.0);
        assert_eq!(v.poll(20_000), 0.0);
    }

    #[test]
    fn multi_step_gap_resets_previous() {
        let v = StepDouble::new(0.0, STEP);
        v.add(5_000, 1.0);
        // Two boundaries crossed at once: the stale value must not surface.
        assert_eq!(v.poll(20_000), 0.0);
    }

    #[test]
    fn rate_is_per_second() {
        let v = StepDouble::new(0.0, 5_000);
        for _ in 0..10 {
            v.add(1_000, 1.0);
        }
        assert_eq!(v.poll_as_rate(5_000), 2.0);
    }

    #[test]
    fn max_bucket_with_nan_identity() {
        let v = StepDouble::new(f64::NAN, STEP);
        v.max(1_000, 42.0);
        v.max(2_000, 44.0);
        v.max(3_000, 43.0);
        assert_eq!(v.poll(10_000), 44.0);
        assert!(v.poll(30_000).is_nan());
    }

    #[test]
    fn step_long_counts() {
        let v = StepLong::new(0, STEP);
        v.add(1_000, 3);
        v.add(2_000, 4);
        assert_eq!(v.current(2_000), 7);
        assert_eq!(v.poll(10_000), 7);
        assert_eq!(v.poll(20_000), 0);
    }

    #[test]
    fn boundary_helper() {
        assert_eq!(step_boundary(12_345, 5_000), 10_000);
        assert_eq!(step_boundary(10_000, 5_000), 10_000);
    }

    // Whatever the write time within a bucket, only the directly following
    // bucket may report the value.
    #[rstest::rstest]
    #[case(0, 10_000, 1.0)]
    #[case(9_999, 10_000, 1.0)]
    #[case(5_000, 19_999, 1.0)]
    #[case(5_000, 20_000, 0.0)]
    #[case(5_000, 90_000, 0.0)]
    fn rollover_grid(#[case] write_at: u64, #[case] read_at: u64, #[case] expected: f64) {
        let v = StepDouble::new(0.0, STEP);
        v.add(write_at, 1.0);
        assert_eq!(v.poll(read_at), expected);
    }
}
