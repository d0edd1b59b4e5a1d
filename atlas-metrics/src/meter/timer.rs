//! Timer for short durations.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::clock::Clock;
use crate::id::Id;
use crate::measurement::Measurement;
use crate::meter::{Meter, MeterBase, Statistic};
use crate::step::{StepDouble, StepLong};

static NOOP_ID: Lazy<Id> = Lazy::new(|| Id::new("noop"));

const NANOS_PER_SECOND: f64 = 1e9;

#[derive(Debug)]
struct TimerInner {
    base: MeterBase,
    count: StepLong,
    // Accumulated in nanoseconds, published in seconds.
    total_time: StepDouble,
    total_sq: StepDouble,
    max: StepDouble,
}

/// Measures how long events take. Same algebra as a distribution summary
/// with amounts in nanoseconds; the published `totalTime` and `max`
/// statistics are converted to seconds.
#[derive(Clone, Debug)]
pub struct Timer {
    inner: Option<Arc<TimerInner>>,
}

impl Timer {
    pub(crate) fn new(id: Id, clock: Arc<dyn Clock>, step: u64, ttl: u64) -> Self {
        Timer {
            inner: Some(Arc::new(TimerInner {
                base: MeterBase::new(id, clock, step, ttl),
                count: StepLong::new(0, step),
                total_time: StepDouble::new(0.0, step),
                total_sq: StepDouble::new(0.0, step),
                max: StepDouble::new(f64::NAN, step),
            })),
        }
    }

    pub(crate) fn noop() -> Self {
        Timer { inner: None }
    }

    /// True if this handle discards all updates.
    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    /// Record a single duration.
    pub fn record(&self, duration: Duration) {
        let Some(inner) = &self.inner else { return };
        let now = inner.base.clock.wall_time();
        let nanos = duration.as_nanos() as f64;
        inner.count.add(now, 1);
        inner.total_time.add(now, nanos);
        inner.total_sq.add(now, nanos * nanos);
        inner.max.max(now, nanos);
        inner.base.touch();
    }

    /// Time a closure and record its elapsed monotonic time.
    pub fn time<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.inner {
            Some(inner) => {
                let start = inner.base.clock.monotonic_time();
                let result = f();
                let elapsed = inner.base.clock.monotonic_time().saturating_sub(start);
                self.record(Duration::from_nanos(elapsed));
                result
            }
            None => f(),
        }
    }

    /// Number of durations recorded in the current, incomplete step.
    pub fn actual_count(&self) -> i64 {
        match &self.inner {
            Some(inner) => inner.count.current(inner.base.clock.wall_time()),
            None => 0,
        }
    }

    /// Time accumulated in the current, incomplete step.
    pub fn actual_total_time(&self) -> Duration {
        match &self.inner {
            Some(inner) => {
                Duration::from_nanos(inner.total_time.current(inner.base.clock.wall_time()) as u64)
            }
            None => Duration::ZERO,
        }
    }
}

impl Meter for Timer {
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
        let t = inner.base.step_time();
        let step_seconds = inner.base.step as f64 / 1000.0;
        vec![
            Measurement::new(
                inner.base.stat_id(Statistic::Count),
                t,
                inner.count.poll_as_rate(now),
            ),
            Measurement::new(
                inner.base.stat_id(Statistic::TotalTime),
                t,
                inner.total_time.poll(now) / NANOS_PER_SECOND / step_seconds,
            ),
            Measurement::new(
                inner.base.stat_id(Statistic::TotalOfSquares),
                t,
                inner.total_sq.poll(now) / (NANOS_PER_SECOND * NANOS_PER_SECOND) / step_seconds,
            ),
            Measurement::new(
                inner.base.stat_id(Statistic::Max),
                t,
                inner.max.poll(now) / NANOS_PER_SECOND,
            ),
        ]
    }

    fn has_expired(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.base.expired(),
            None => true,
        }
    }
}
