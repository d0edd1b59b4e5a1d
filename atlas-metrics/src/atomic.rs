//! Lock-free floating point cell.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// An `f64` that can be updated atomically. Floating point values have no
/// native atomics, so operations work on the bit representation stored in an
/// `AtomicU64` with compare-exchange loops for the read-modify-write cases.
pub struct AtomicF64 {
    inner: AtomicU64,
}

impl AtomicF64 {
    /// Create a cell holding `init`.
    pub fn new(init: f64) -> Self {
        AtomicF64 {
            inner: AtomicU64::new(init.to_bits()),
        }
    }

    /// Current value.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.inner.load(Ordering::Relaxed))
    }

    /// Store `value`.
    pub fn set(&self, value: f64) {
        self.inner.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Store `value` and return the previous value.
    pub fn get_and_set(&self, value: f64) -> f64 {
        f64::from_bits(self.inner.swap(value.to_bits(), Ordering::Relaxed))
    }

    /// Store `new` if the current value is bit-identical to `expected`.
    /// Returns true if the store happened.
    pub fn compare_and_set(&self, expected: f64, new: f64) -> bool {
        self.inner
            .compare_exchange(
                expected.to_bits(),
                new.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Add `amount` and return the updated value.
    pub fn add_and_get(&self, amount: f64) -> f64 {
        let mut current = self.inner.load(Ordering::Relaxed);
        loop {
            let next = f64::from_bits(current) + amount;
            match self.inner.compare_exchange(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(v) => current = v,
            }
        }
    }

    /// Add `amount` and return the value before the addition.
    pub fn get_and_add(&self, amount: f64) -> f64 {
        self.add_and_get(amount) - amount
    }

    /// Update the cell to `value` if it is less than the current value. An
    /// incoming NaN is ignored; a stored NaN is replaced by any incoming
    /// value.
    pub fn min(&self, value: f64) {
        if value.is_nan() {
            return;
        }
        let mut current = self.inner.load(Ordering::Relaxed);
        loop {
            let v = f64::from_bits(current);
            if !v.is_nan() && v <= value {
                return;
            }
            match self.inner.compare_exchange(
                current,
                value.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(c) => current = c,
            }
        }
    }

    /// Update the cell to `value` if it is greater than the current value.
    /// Same NaN handling as [`AtomicF64::min`].
    pub fn max(&self, value: f64) {
        if value.is_nan() {
            return;
        }
        let mut current = self.inner.load(Ordering::Relaxed);
        loop {
            let v = f64::from_bits(current);
            if !v.is_nan() && v >= value {
                return;
            }
            match self.inner.compare_exchange(
                current,
                value.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(c) => current = c,
            }
        }
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        AtomicF64::new(0.0)
    }
}

impl fmt::Debug for AtomicF64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicF64").field(&self.get()).finish()
    }
}
