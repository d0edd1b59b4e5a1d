//! Last-write-wins gauge.

use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::atomic::AtomicF64;
use crate::clock::Clock;
use crate::id::Id;
use crate::measurement::Measurement;
use crate::meter::{Meter, MeterBase, Statistic};

static NOOP_ID: Lazy<Id> = Lazy::new(|| Id::new("noop"));

#[derive(Debug)]
struct GaugeInner {
    base: MeterBase,
    value: AtomicF64,
}

/// Reports the most recently written value. The value is NaN until the
/// first write and again after the gauge expires.
#[derive(Clone, Debug)]
pub struct Gauge {
    inner: Option<Arc<GaugeInner>>,
}

impl Gauge {
    pub(crate) fn new(id: Id, clock: Arc<dyn Clock>, step: u64, ttl: u64) -> Self {
        Gauge {
            inner: Some(Arc::new(GaugeInner {
                base: MeterBase::new(id, clock, step, ttl),
                value: AtomicF64::new(f64::NAN),
            })),
        }
    }

    pub(crate) fn noop() -> Self {
        Gauge { inner: None }
    }

    /// True if this handle discards all updates.
    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    /// Set the current value.
    pub fn set(&self, value: f64) {
        let Some(inner) = &self.inner else { return };
        inner.value.set(value);
        inner.base.touch();
    }

    /// Current value, NaN if never set or expired.
    pub fn value(&self) -> f64 {
        match &self.inner {
            Some(inner) => {
                if inner.base.expired() {
                    f64::NAN
                } else {
                    inner.value.get()
                }
            }
            None => f64::NAN,
        }
    }
}

impl Meter for Gauge {
    fn id(&self) -> &Id {
        match &self.inner {
            Some(inner) => &inner.base.id,
            None => &NOOP_ID,
        }
    }

    fn measure(&self) -> Vec<Measurement> {
        let Some(inner) = &self.inner else {
            return Vec::new();
        };
        vec![Measurement::new(
            inner.base.stat_id(Statistic::Gauge),
            inner.base.step_time(),
            self.value(),
        )]
    }

    fn has_expired(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.base.expired(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn nan_until_first_write() {
        let clock = Arc::new(ManualClock::new());
        let g = Gauge::new(Id::new("queue.depth"), clock, 5_000, 900_000);
        assert!(g.value().is_nan());
        g.set(7.0);
        assert_eq!(g.value(), 7.0);
    }

    #[test]
    fn last_write_wins() {
        let clock = Arc::new(ManualClock::new());
        let g = Gauge::new(Id::new("queue.depth"), clock, 5_000, 900_000);
        g.set(1.0);
        g.set(3.0);
        g.set(2.0);
        assert_eq!(g.value(), 2.0);
    }

    #[test]
    fn nan_after_expiry() {
        let clock = Arc::new(ManualClock::new());
        let g = Gauge::new(Id::new("queue.depth"), clock.clone(), 5_000, 60_000);
        g.set(5.0);
        clock.set_wall_time(61_000);
        assert!(g.value().is_nan());
        assert!(g.has_expired());
    }
}
