//! Distribution summary for sizes and other non-negative amounts.

use std::sync::Arc;

use crate::clock::Clock;
use crate::id::Id;
use crate::measurement::Measurement;
use crate::meter::{Meter, MeterBase, Statistic};
use crate::step::{StepDouble, StepLong};

#[derive(Debug)]
struct SummaryInner {
    base: MeterBase,
    count: StepLong,
    total: StepDouble,
    total_sq: StepDouble,
    max: StepDouble,
}

/// Tracks the distribution of recorded amounts. Publishes four statistics
/// per step: `count`, `totalAmount` and `totalOfSquares` as rates plus the
/// step `max` as a gauge, enough for the backend to derive averages and
/// standard deviations.
#[derive(Clone, Debug)]
pub struct DistributionSummary {
    inner: Option<Arc<SummaryInner>>,
}

impl DistributionSummary {
    pub(crate) fn new(id: Id, clock: Arc<dyn Clock>, step: u64, ttl: u64) -> Self {
        DistributionSummary {
            inner: Some(Arc::new(SummaryInner {
                base: MeterBase::new(id, clock, step, ttl),
                count: StepLong::new(0, step),
                total: StepDouble::new(0.0, step),
                total_sq: StepDouble::new(0.0, step),
                max: StepDouble::new(f64::NAN, step),
            })),
        }
    }

    pub(crate) fn noop() -> Self {
        DistributionSummary { inner: None }
    }

    /// True if this handle discards all updates.
    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    /// Record a single amount.
    pub fn record(&self, amount: u64) {
        let Some(inner) = &self.inner else { return };
        let now = inner.base.clock.wall_time();
        let v = amount as f64;
        inner.count.add(now, 1);
        inner.total.add(now, v);
        inner.total_sq.add(now, v * v);
        inner.max.max(now, v);
        inner.base.touch();
    }

    /// Number of amounts recorded in the current, incomplete step.
    pub fn actual_count(&self) -> i64 {
        match &self.inner {
            Some(inner) => inner.count.current(inner.base.clock.wall_time()),
            None => 0,
        }
    }

    /// Sum of amounts recorded in the current, incomplete step.
    pub fn actual_total(&self) -> f64 {
        match &self.inner {
            Some(inner) => inner.total.current(inner.base.clock.wall_time()),
            None => 0.0,
        }
    }
}

impl Meter for DistributionSummary {
    fn id(&self) -> &Id {
        static NOOP_ID: once_cell::sync::Lazy<Id> = once_cell::sync::Lazy::new(|| Id::new("noop"));
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
        let t = inner.base.step_time();
        vec![
            Measurement::new(
                inner.base.stat_id(Statistic::Count),
                t,
                inner.count.poll_as_rate(now),
            ),
            Measurement::new(
                inner.base.stat_id(Statistic::TotalAmount),
                t,
                inner.total.poll_as_rate(now),
            ),
            Measurement::new(
                inner.base.stat_id(Statistic::TotalOfSquares),
                t,
                inner.total_sq.poll_as_rate(now),
            ),
            Measurement::new(inner.base.stat_id(Statistic::Max), t, inner.max.poll(now)),
        ]
    }

    fn has_expired(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.base.expired(),
            None => true,
        }
    }
}
