//! Background sampling of externally owned values.
//!
//! A polled meter binds an id, a weakly-held source object and a function
//! extracting a value from it. The scheduler periodically invokes the
//! function and writes the result into the underlying meter; once the
//! source is dropped the entry disappears on the next poll and the meter is
//! left to expire.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::atlas_log;
use crate::id::Id;
use crate::meter::{Counter, Gauge};
use crate::registry::Registry;
use crate::scheduler::{RepeatPolicy, Scheduler, SchedulerOptions, TaskHandle};

/// Default polling frequency: 10 seconds.
pub const DEFAULT_POLLING_FREQUENCY: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct GaugeEntry {
    // None once the weakly-held source has been dropped.
    value_fn: Box<dyn Fn() -> Option<f64> + Send + Sync>,
}

struct PolledGaugeState {
    gauge: Gauge,
    entries: Mutex<Vec<GaugeEntry>>,
    task: Mutex<Option<TaskHandle>>,
}

/// Common shape of the per-id polling state.
trait PollTarget: Send + Sync + 'static {
    /// Poll once. Returns false once no live entries remain.
    fn tick(&self) -> bool;

    fn task_slot(&self) -> &Mutex<Option<TaskHandle>>;
}

impl PollTarget for PolledGaugeState {
    /// Poll all live entries and write their sum. Entries whose source is
    /// gone are removed; NaN values contribute nothing.
    fn tick(&self) -> bool {
        let mut entries = lock(&self.entries);
        let mut sum = f64::NAN;
        entries.retain(|e| match (e.value_fn)() {
            Some(v) => {
                if !v.is_nan() {
                    sum = if sum.is_nan() { v } else { sum + v };
                }
                true
            }
            None => false,
        });
        self.gauge.set(sum);
        !entries.is_empty()
    }

    fn task_slot(&self) -> &Mutex<Option<TaskHandle>> {
        &self.task
    }
}

impl PolledGaugeState {
    fn cancel(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.cancel();
        }
    }
}

struct MonotonicEntry {
    value_fn: Box<dyn Fn() -> Option<u64> + Send + Sync>,
    previous: u64,
}

struct PolledCounterState {
    counter: Counter,
    entries: Mutex<Vec<MonotonicEntry>>,
    task: Mutex<Option<TaskHandle>>,
}

impl PollTarget for PolledCounterState {
    /// Poll all live entries and add the positive deltas to the counter. A
    /// decrease is treated as a source reset: the baseline moves but no
    /// delta is emitted.
    fn tick(&self) -> bool {
        let mut entries = lock(&self.entries);
        entries.retain_mut(|e| match (e.value_fn)() {
            Some(v) => {
                if v > e.previous {
                    self.counter.add((v - e.previous) as f64);
                }
                e.previous = v;
                true
            }
            None => false,
        });
        !entries.is_empty()
    }

    fn task_slot(&self) -> &Mutex<Option<TaskHandle>> {
        &self.task
    }
}

impl PolledCounterState {
    fn cancel(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.cancel();
        }
    }
}

/// Entry point for monitoring externally owned objects.
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use atlas_metrics::{PolledMeter, Registry, Scheduler, Id};
///
/// let registry = Registry::builder().build();
/// let scheduler = Scheduler::new("poller", 1);
/// let queue = Arc::new(AtomicU64::new(0));
/// PolledMeter::using(&registry)
///     .with_id(Id::new("queue.depth"))
///     .monitor_value(&scheduler, &queue, |q| q.load(Ordering::Relaxed) as f64);
/// ```
#[derive(Debug)]
pub struct PolledMeter;

impl PolledMeter {
    /// Start building a polled meter for the given registry.
    pub fn using(registry: &Registry) -> PolledMeterBuilder {
        PolledMeterBuilder {
            registry: registry.clone(),
            id: None,
            frequency: DEFAULT_POLLING_FREQUENCY,
        }
    }

    /// Cancel the scheduled polling for `id` and clear the binding. The
    /// underlying meter is left to expire normally.
    pub fn remove(registry: &Registry, id: &Id) {
        if let Some((_, state)) = registry.state().remove(id) {
            if let Ok(gauge) = state.clone().downcast::<PolledGaugeState>() {
                gauge.cancel();
            } else if let Ok(counter) = state.downcast::<PolledCounterState>() {
                counter.cancel();
            }
        }
    }
}

/// Builder binding an id and polling frequency to a source object.
pub struct PolledMeterBuilder {
    registry: Registry,
    id: Option<Id>,
    frequency: Duration,
}

impl PolledMeterBuilder {
    /// Id of the underlying meter.
    pub fn with_id(mut self, id: Id) -> Self {
        self.id = Some(id);
        self
    }

    /// Name-only id of the underlying meter.
    pub fn with_name(mut self, name: &str) -> Self {
        self.id = Some(Id::new(name));
        self
    }

    /// How often the value is sampled.
    pub fn with_frequency(mut self, frequency: Duration) -> Self {
        self.frequency = frequency;
        self
    }

    fn id(&self) -> Id {
        self.id.clone().unwrap_or_else(|| Id::new("unknown"))
    }

    /// Sample `f(obj)` periodically and report the result as a gauge.
    /// Multiple registrations against the same id are summed. The object is
    /// held weakly; dropping the last strong reference tears the entry
    /// down.
    pub fn monitor_value<T: Send + Sync + 'static>(
        self,
        scheduler: &Scheduler,
        obj: &Arc<T>,
        f: impl Fn(&T) -> f64 + Send + Sync + 'static,
    ) {
        let id = self.id();
        let weak: Weak<T> = Arc::downgrade(obj);
        let value_fn = Box::new(move || weak.upgrade().map(|o| f(&o)));

        let registry = self.registry.clone();
        let state = self.registry.state_get_or_init(&id, || {
            Arc::new(PolledGaugeState {
                gauge: registry.gauge(id.clone()),
                entries: Mutex::new(Vec::new()),
                task: Mutex::new(None),
            })
        });
        lock(&state.entries).push(GaugeEntry { value_fn });
        self.schedule_if_needed(scheduler, &id, state);
    }

    /// Sample a monotonically increasing `f(obj)` periodically and add the
    /// positive deltas to a counter. A decrease is treated as a reset.
    pub fn monitor_monotonic_counter<T: Send + Sync + 'static>(
        self,
        scheduler: &Scheduler,
        obj: &Arc<T>,
        f: impl Fn(&T) -> u64 + Send + Sync + 'static,
    ) {
        let id = self.id();
        let weak: Weak<T> = Arc::downgrade(obj);
        let value_fn: Box<dyn Fn() -> Option<u64> + Send + Sync> =
            Box::new(move || weak.upgrade().map(|o| f(&o)));
        // Baseline so the preexisting total is not emitted as a delta.
        let previous = value_fn().unwrap_or(0);

        let registry = self.registry.clone();
        let state = self.registry.state_get_or_init(&id, || {
            Arc::new(PolledCounterState {
                counter: registry.counter(id.clone()),
                entries: Mutex::new(Vec::new()),
                task: Mutex::new(None),
            })
        });
        lock(&state.entries).push(MonotonicEntry { value_fn, previous });
        self.schedule_if_needed(scheduler, &id, state);
    }

    fn schedule_if_needed(&self, scheduler: &Scheduler, id: &Id, state: Arc<dyn PollTarget>) {
        let mut task = lock(state.task_slot());
        if task.is_some() {
            return;
        }
        let registry = self.registry.clone();
        let poll_id = id.clone();
        let tick_state = state.clone();
        let handle = scheduler.schedule(
            SchedulerOptions::new(RepeatPolicy::FixedRateSkip(self.frequency))
                .with_initial_delay(self.frequency),
            move || {
                if !tick_state.tick() {
                    atlas_log!(debug, name: "PolledMeter.expired", id = poll_id.to_string());
                    registry.state().remove(&poll_id);
                    if let Some(task) = lock(tick_state.task_slot()).take() {
                        task.cancel();
                    }
                }
            },
        );
        *task = Some(handle);
    }
}

impl fmt::Debug for PolledMeterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolledMeterBuilder")
            .field("id", &self.id)
            .field("frequency", &self.frequency)
            .finish()
    }
}
