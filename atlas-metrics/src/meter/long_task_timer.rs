//! Timer for tasks long enough to outlive a publish step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::clock::Clock;
use crate::id::Id;
use crate::measurement::Measurement;
use crate::meter::{Meter, MeterBase, Statistic};

static NOOP_ID: Lazy<Id> = Lazy::new(|| Id::new("noop"));

#[derive(Debug)]
struct LongTaskTimerInner {
    base: MeterBase,
    next_task: AtomicI64,
    // task id -> monotonic start time in nanoseconds
    tasks: Mutex<HashMap<i64, u64>>,
}

/// Tracks tasks that are still running. Instead of recording a duration
/// when a task completes, it samples the in-flight tasks on demand and
/// publishes two gauges: the sum of elapsed seconds (`duration`) and the
/// number of running tasks (`activeTasks`).
#[derive(Clone, Debug)]
pub struct LongTaskTimer {
    inner: Option<Arc<LongTaskTimerInner>>,
}

impl LongTaskTimer {
    pub(crate) fn new(id: Id, clock: Arc<dyn Clock>, step: u64, ttl: u64) -> Self {
        LongTaskTimer {
            inner: Some(Arc::new(LongTaskTimerInner {
                base: MeterBase::new(id, clock, step, ttl),
                next_task: AtomicI64::new(0),
                tasks: Mutex::new(HashMap::new()),
            })),
        }
    }

    pub(crate) fn noop() -> Self {
        LongTaskTimer { inner: None }
    }

    /// True if this handle discards all updates.
    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    /// Start tracking a task. Returns the id to pass to [`LongTaskTimer::stop`].
    pub fn start(&self) -> i64 {
        let Some(inner) = &self.inner else { return -1 };
        let task = inner.next_task.fetch_add(1, Ordering::Relaxed);
        let now = inner.base.clock.monotonic_time();
        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.insert(task, now);
        }
        inner.base.touch();
        task
    }

    /// Stop tracking a task. Returns the elapsed monotonic nanoseconds, or
    /// -1 if the task id is unknown.
    pub fn stop(&self, task: i64) -> i64 {
        let Some(inner) = &self.inner else { return -1 };
        let now = inner.base.clock.monotonic_time();
        let started = inner.tasks.lock().ok().and_then(|mut t| t.remove(&task));
        inner.base.touch();
        match started {
            Some(start) => now.saturating_sub(start) as i64,
            None => -1,
        }
    }

    /// Number of tasks currently running.
    pub fn active_tasks(&self) -> usize {
        match &self.inner {
            Some(inner) => inner.tasks.lock().map(|t| t.len()).unwrap_or(0),
            None => 0,
        }
    }

    /// Sum of the elapsed time of all running tasks, in seconds.
    pub fn duration(&self) -> f64 {
        match &self.inner {
            Some(inner) => {
                let now = inner.base.clock.monotonic_time();
                inner
                    .tasks
                    .lock()
                    .map(|t| {
                        t.values()
                            .map(|start| now.saturating_sub(*start) as f64 / 1e9)
                            .sum()
                    })
                    .unwrap_or(0.0)
            }
            None => 0.0,
        }
    }
}

impl Meter for LongTaskTimer {
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
        let t = inner.base.step_time();
        vec![
            Measurement::new(inner.base.stat_id(Statistic::Duration), t, self.duration()),
            Measurement::new(
                inner.base.stat_id(Statistic::ActiveTasks),
                t,
                self.active_tasks() as f64,
            ),
        ]
    }

    fn has_expired(&self) -> bool {
        match &self.inner {
            // In-flight tasks keep the meter alive regardless of the TTL.
            Some(inner) => self.active_tasks() == 0 && inner.base.expired(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn tracks_in_flight_tasks() {
        let clock = Arc::new(ManualClock::new());
        let t = LongTaskTimer::new(Id::new("backup"), clock.clone(), 5_000, 900_000);
        let a = t.start();
        clock.set_monotonic_time(2_000_000_000);
        let b = t.start();
        clock.set_monotonic_time(5_000_000_000);
        assert_eq!(t.active_tasks(), 2);
        // a has been running 5s, b for 3s
        assert_eq!(t.duration(), 8.0);
        assert_eq!(t.stop(a), 5_000_000_000);
        assert_eq!(t.active_tasks(), 1);
        assert_eq!(t.stop(b), 3_000_000_000);
    }

    #[test]
    fn stop_unknown_returns_negative_one() {
        let clock = Arc::new(ManualClock::new());
        let t = LongTaskTimer::new(Id::new("backup"), clock, 5_000, 900_000);
        assert_eq!(t.stop(99), -1);
    }

    #[test]
    fn expires_after_ttl_of_inactivity() {
        let clock = Arc::new(ManualClock::new());
        let t = LongTaskTimer::new(Id::new("backup"), clock.clone(), 5_000, 60_000);
        let task = t.stop(t.start());
        assert!(task >= 0);
        assert!(!t.has_expired());
        clock.set_wall_time(61_000);
        assert!(t.has_expired());
    }

    #[test]
    fn running_task_prevents_expiry() {
        let clock = Arc::new(ManualClock::new());
        let t = LongTaskTimer::new(Id::new("backup"), clock.clone(), 5_000, 60_000);
        let task = t.start();
        clock.set_wall_time(120_000);
        assert!(!t.has_expired());
        t.stop(task);
        clock.set_wall_time(240_000);
        assert!(t.has_expired());
    }

    #[test]
    fn measures_duration_and_active() {
        let clock = Arc::new(ManualClock::new());
        let t = LongTaskTimer::new(Id::new("backup"), clock.clone(), 5_000, 900_000);
        t.start();
        clock.set_monotonic_time(1_500_000_000);
        let ms = t.measure();
        let stat = |name: &str| {
            ms.iter()
                .find(|m| m.id().tag_value("statistic") == Some(name))
                .map(Measurement::value)
                .unwrap()
        };
        assert_eq!(stat("duration"), 1.5);
        assert_eq!(stat("activeTasks"), 1.0);
    }
}
