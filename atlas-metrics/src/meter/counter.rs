//! Counter for events per second.

use std::sync::Arc;

use crate::atlas_log;
use crate::clock::Clock;
use crate::id::Id;
use crate::measurement::Measurement;
use crate::meter::{Meter, MeterBase, Statistic};
use crate::step::StepDouble;

use once_cell::sync::Lazy;

static NOOP_ID: Lazy<Id> = Lazy::new(|| Id::new("noop"));

#[derive(Debug)]
struct CounterInner {
    base: MeterBase,
    value: StepDouble,
}

/// Measures a rate of events. Increments accumulate into the current step
/// bucket; the published `count` statistic is the completed bucket divided
/// by the step in seconds.
///
/// Cloning a counter is cheap and returns a handle to the same accumulator.
#[derive(Clone, Debug)]
pub struct Counter {
    inner: Option<Arc<CounterInner>>,
}

impl Counter {
    pub(crate) fn new(id: Id, clock: Arc<dyn Clock>, step: u64, ttl: u64) -> Self {
        Counter {
            inner: Some(Arc::new(CounterInner {
                base: MeterBase::new(id, clock, step, ttl),
                value: StepDouble::new(0.0, step),
            })),
        }
    }

    /// A counter whose operations are sinks, returned on registry type
    /// mismatches so callers stay bounded.
    pub(crate) fn noop() -> Self {
        Counter { inner: None }
    }

    /// True if this handle discards all updates.
    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    /// Increment by one.
    pub fn increment(&self) {
        self.add(1.0);
    }

    /// Add a non-negative amount. Negative or NaN amounts are ignored.
    pub fn add(&self, amount: f64) {
        let Some(inner) = &self.inner else { return };
        if amount.is_nan() || amount <= 0.0 {
            if amount < 0.0 {
                atlas_log!(debug, name: "Counter.add", id = inner.base.id.to_string(), amount = amount);
            }
            return;
        }
        inner.value.add(inner.base.clock.wall_time(), amount);
        inner.base.touch();
    }

    /// Amount accumulated in the current, incomplete step.
    pub fn actual_count(&self) -> f64 {
        match &self.inner {
            Some(inner) => inner.value.current(inner.base.clock.wall_time()),
            None => 0.0,
        }
    }
}

impl Meter for Counter {
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
            inner.base.stat_id(Statistic::Count),
            inner.base.step_time(),
            inner.value.poll_as_rate(now),
        )]
    }

    fn has_expired(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.base.expired(),
            None => true,
        }
    }
}
