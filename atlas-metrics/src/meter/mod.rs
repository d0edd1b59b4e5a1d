//! Meter primitives.
//!
//! A meter is a live value producer owned by exactly one registry. Each
//! primitive accumulates into step buckets (or atomic cells for gauges) and
//! reports completed buckets through [`Meter::measure`], deriving one id per
//! statistic from its own id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::Clock;
use crate::id::Id;
use crate::measurement::Measurement;

mod counter;
mod distribution_summary;
mod gauge;
mod long_task_timer;
mod max_gauge;
mod percentile;
mod timer;

pub use counter::Counter;
pub use distribution_summary::DistributionSummary;
pub use gauge::Gauge;
pub use long_task_timer::LongTaskTimer;
pub use max_gauge::MaxGauge;
pub use percentile::{
    PercentileBuckets, PercentileDistributionSummary, PercentileTimer,
};
pub use timer::Timer;

/// Tag key used to distinguish the derived series of a meter.
pub const STATISTIC: &str = "statistic";

/// The statistic reported by a derived measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statistic {
    /// Rate of events per second over the completed step.
    Count,
    /// Rate of the accumulated amount per second over the completed step.
    TotalAmount,
    /// Rate of the accumulated time in seconds per second over the step.
    TotalTime,
    /// Rate of the accumulated squared amount over the step.
    TotalOfSquares,
    /// Maximum observed value over the completed step.
    Max,
    /// Instantaneous last-written value.
    Gauge,
    /// Number of currently running tasks.
    ActiveTasks,
    /// Sum of elapsed seconds of currently running tasks.
    Duration,
    /// Count for one percentile bucket.
    Percentile,
}

impl Statistic {
    /// Tag value for this statistic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Statistic::Count => "count",
            Statistic::TotalAmount => "totalAmount",
            Statistic::TotalTime => "totalTime",
            Statistic::TotalOfSquares => "totalOfSquares",
            Statistic::Max => "max",
            Statistic::Gauge => "gauge",
            Statistic::ActiveTasks => "activeTasks",
            Statistic::Duration => "duration",
            Statistic::Percentile => "percentile",
        }
    }

    /// True for statistics that accumulate and publish as rates, false for
    /// instantaneous values reported as-is.
    pub fn is_rate(&self) -> bool {
        matches!(
            self,
            Statistic::Count
                | Statistic::TotalAmount
                | Statistic::TotalTime
                | Statistic::TotalOfSquares
                | Statistic::Percentile
        )
    }
}

/// Kind of meter bound to an id, reported on type mismatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterKind {
    /// [`Counter`]
    Counter,
    /// [`DistributionSummary`]
    DistributionSummary,
    /// [`Timer`]
    Timer,
    /// [`Gauge`]
    Gauge,
    /// [`MaxGauge`]
    MaxGauge,
    /// [`LongTaskTimer`]
    LongTaskTimer,
    /// A user-provided [`Meter`] implementation.
    Custom,
}

/// A live value producer identified by an [`Id`].
pub trait Meter: Send + Sync {
    /// Identity of this meter.
    fn id(&self) -> &Id;

    /// Sample the meter. Returns one measurement per statistic, each with an
    /// id derived from the meter id by adding a `statistic` tag.
    fn measure(&self) -> Vec<Measurement>;

    /// True once the meter is eligible for reclamation by the registry.
    fn has_expired(&self) -> bool;
}

/// State shared by the concrete meter implementations: identity, time
/// source, step size and the activity timestamp driving TTL expiry.
pub(crate) struct MeterBase {
    pub(crate) id: Id,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) step: u64,
    ttl: u64,
    last_updated: AtomicU64,
}

impl MeterBase {
    pub(crate) fn new(id: Id, clock: Arc<dyn Clock>, step: u64, ttl: u64) -> Self {
        let now = clock.wall_time();
        MeterBase {
            id,
            clock,
            step,
            ttl,
            last_updated: AtomicU64::new(now),
        }
    }

    pub(crate) fn touch(&self) {
        self.last_updated
            .store(self.clock.wall_time(), Ordering::Relaxed);
    }

    pub(crate) fn expired(&self) -> bool {
        let now = self.clock.wall_time();
        now.saturating_sub(self.last_updated.load(Ordering::Relaxed)) > self.ttl
    }

    /// Id for a derived series.
    pub(crate) fn stat_id(&self, stat: Statistic) -> Id {
        self.id.with_tag(STATISTIC, stat.as_str())
    }

    /// Wall timestamp of the start of the most recently completed step
    /// bucket, which is the bucket `measure` reports.
    pub(crate) fn step_time(&self) -> u64 {
        crate::step::step_boundary(self.clock.wall_time(), self.step).saturating_sub(self.step)
    }
}

impl std::fmt::Debug for MeterBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeterBase").field("id", &self.id).finish()
    }
}
