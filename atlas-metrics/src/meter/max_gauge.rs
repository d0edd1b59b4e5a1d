//! Gauge reporting the maximum value observed within a step.

use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::clock::Clock;
use crate::id::Id;
use crate::measurement::Measurement;
use crate::meter::{Meter, MeterBase, Statistic};
use crate::step::StepDouble;

static NOOP_ID: Lazy<Id> = Lazy::new(|| Id::new("noop"));

#[derive(Debug)]
struct MaxGaugeInner {
    base: MeterBase,
    value: StepDouble,
}

/// Tracks the maximum value written during each step. Negative values and
/// NaN are ignored; an empty step publishes NaN.
#[derive(Clone, Debug)]
pub struct MaxGauge {
    inner: Option<Arc<MaxGaugeInner>>,
}

impl MaxGauge {
    pub(crate) fn new(id: Id, clock: Arc<dyn Clock>, step: u64, ttl: u64) -> Self {
        MaxGauge {
            inner: Some(Arc::new(MaxGaugeInner {
                base: MeterBase::new(id, clock, step, ttl),
                value: StepDouble::new(f64::NAN, step),
            })),
        }
    }

    pub(crate) fn noop() -> Self {
        MaxGauge { inner: None }
    }

    /// True if this handle discards all updates.
    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    /// Update the step maximum. Negative values and NaN are ignored.
    pub fn set(&self, value: f64) {
        let Some(inner) = &self.inner else { return };
        if value.is_nan() || value < 0.0 {
            return;
        }
        inner.value.max(inner.base.clock.wall_time(), value);
        inner.base.touch();
    }

    /// Maximum observed in the current, incomplete step.
    pub fn actual_value(&self) -> f64 {
        match &self.inner {
            Some(inner) => inner.value.current(inner.base.clock.wall_time()),
            None => f64::NAN,
        }
    }
}

impl Meter for MaxGauge {
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
        let now = inner.base.clock.wall_time();
        vec![Measurement::new(
            inner.base.stat_id(Statistic::Max),
            inner.base.step_time(),
            inner.value.poll(now),
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
    fn reports_step_maximum() {
        let clock = Arc::new(ManualClock::new());
        let g = MaxGauge::new(Id::new("conn.max"), clock.clone(), 10_000, 900_000);
        g.set(42.0);
        g.set(44.0);
        g.set(43.0);
        clock.set_wall_time(10_000);
        let ms = g.measure();
        assert_eq!(ms[0].value(), 44.0);
    }

    #[test]
    fn negative_and_nan_ignored() {
        let clock = Arc::new(ManualClock::new());
        let g = MaxGauge::new(Id::new("conn.max"), clock.clone(), 10_000, 900_000);
        g.set(-1.0);
        g.set(f64::NAN);
        g.set(2.0);
        g.set(-100.0);
        assert_eq!(g.actual_value(), 2.0);
    }
}
