//! Process-wide container mapping ids to meters.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::atlas_log;
use crate::clock::{Clock, SystemClock};
use crate::id::Id;
use crate::measurement::Measurement;
use crate::meter::{
    Counter, DistributionSummary, Gauge, LongTaskTimer, MaxGauge, Meter, MeterKind, Timer,
};

/// Default primary step: 5 seconds.
pub const DEFAULT_STEP: u64 = 5_000;

/// Default meter TTL: 15 minutes of inactivity.
pub const DEFAULT_METER_TTL: u64 = 15 * 60 * 1000;

/// Called when a lookup requests a different meter kind than the one bound
/// to the id. Arguments: the id, the requested kind, the existing kind.
pub type TypeMismatchHandler = Arc<dyn Fn(&Id, MeterKind, MeterKind) + Send + Sync>;

#[derive(Clone)]
enum AnyMeter {
    Counter(Counter),
    DistributionSummary(DistributionSummary),
    Timer(Timer),
    Gauge(Gauge),
    MaxGauge(MaxGauge),
    LongTaskTimer(LongTaskTimer),
    Custom(Arc<dyn Meter>),
}

impl AnyMeter {
    fn kind(&self) -> MeterKind {
        match self {
            AnyMeter::Counter(_) => MeterKind::Counter,
            AnyMeter::DistributionSummary(_) => MeterKind::DistributionSummary,
            AnyMeter::Timer(_) => MeterKind::Timer,
            AnyMeter::Gauge(_) => MeterKind::Gauge,
            AnyMeter::MaxGauge(_) => MeterKind::MaxGauge,
            AnyMeter::LongTaskTimer(_) => MeterKind::LongTaskTimer,
            AnyMeter::Custom(_) => MeterKind::Custom,
        }
    }

    fn as_meter(&self) -> &dyn Meter {
        match self {
            AnyMeter::Counter(m) => m,
            AnyMeter::DistributionSummary(m) => m,
            AnyMeter::Timer(m) => m,
            AnyMeter::Gauge(m) => m,
            AnyMeter::MaxGauge(m) => m,
            AnyMeter::LongTaskTimer(m) => m,
            AnyMeter::Custom(m) => m.as_ref(),
        }
    }
}

struct RegistryInner {
    clock: Arc<dyn Clock>,
    step: u64,
    ttl: u64,
    meters: DashMap<Id, AnyMeter>,
    state: DashMap<Id, Arc<dyn Any + Send + Sync>>,
    on_type_mismatch: TypeMismatchHandler,
}

/// Creates and owns meters. Lookups are compute-if-absent on a concurrent
/// map: the first caller creates the meter, concurrent callers get the same
/// instance back. Cloning the registry is cheap and shares all state.
///
/// Requesting an id that is already bound to a different meter kind does not
/// replace the binding; the configured mismatch handler runs and the caller
/// receives a no-op meter so the damage stays local.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// The registry's time source.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock.clone()
    }

    /// Primary step size in milliseconds.
    pub fn step(&self) -> u64 {
        self.inner.step
    }

    /// Get or create the counter for `id`.
    pub fn counter(&self, id: Id) -> Counter {
        match self.inner.meters.entry(id) {
            Entry::Occupied(e) => match e.get() {
                AnyMeter::Counter(c) => c.clone(),
                other => {
                    self.report_mismatch(e.key(), MeterKind::Counter, other.kind());
                    Counter::noop()
                }
            },
            Entry::Vacant(v) => {
                let c = Counter::new(
                    v.key().clone(),
                    self.inner.clock.clone(),
                    self.inner.step,
                    self.inner.ttl,
                );
                v.insert(AnyMeter::Counter(c.clone()));
                c
            }
        }
    }

    /// Get or create the distribution summary for `id`.
    pub fn distribution_summary(&self, id: Id) -> DistributionSummary {
        match self.inner.meters.entry(id) {
            Entry::Occupied(e) => match e.get() {
                AnyMeter::DistributionSummary(m) => m.clone(),
                other => {
                    self.report_mismatch(e.key(), MeterKind::DistributionSummary, other.kind());
                    DistributionSummary::noop()
                }
            },
            Entry::Vacant(v) => {
                let m = DistributionSummary::new(
                    v.key().clone(),
                    self.inner.clock.clone(),
                    self.inner.step,
                    self.inner.ttl,
                );
                v.insert(AnyMeter::DistributionSummary(m.clone()));
                m
            }
        }
    }

    /// Get or create the timer for `id`.
    pub fn timer(&self, id: Id) -> Timer {
        match self.inner.meters.entry(id) {
            Entry::Occupied(e) => match e.get() {
                AnyMeter::Timer(m) => m.clone(),
                other => {
                    self.report_mismatch(e.key(), MeterKind::Timer, other.kind());
                    Timer::noop()
                }
            },
            Entry::Vacant(v) => {
                let m = Timer::new(
                    v.key().clone(),
                    self.inner.clock.clone(),
                    self.inner.step,
                    self.inner.ttl,
                );
                v.insert(AnyMeter::Timer(m.clone()));
                m
            }
        }
    }

    /// Get or create the gauge for `id`.
    pub fn gauge(&self, id: Id) -> Gauge {
        match self.inner.meters.entry(id) {
            Entry::Occupied(e) => match e.get() {
                AnyMeter::Gauge(m) => m.clone(),
                other => {
                    self.report_mismatch(e.key(), MeterKind::Gauge, other.kind());
                    Gauge::noop()
                }
            },
            Entry::Vacant(v) => {
                let m = Gauge::new(
                    v.key().clone(),
                    self.inner.clock.clone(),
                    self.inner.step,
                    self.inner.ttl,
                );
                v.insert(AnyMeter::Gauge(m.clone()));
                m
            }
        }
    }

    /// Get or create the max gauge for `id`.
    pub fn max_gauge(&self, id: Id) -> MaxGauge {
        match self.inner.meters.entry(id) {
            Entry::Occupied(e) => match e.get() {
                AnyMeter::MaxGauge(m) => m.clone(),
                other => {
                    self.report_mismatch(e.key(), MeterKind::MaxGauge, other.kind());
                    MaxGauge::noop()
                }
            },
            Entry::Vacant(v) => {
                let m = MaxGauge::new(
                    v.key().clone(),
                    self.inner.clock.clone(),
                    self.inner.step,
                    self.inner.ttl,
                );
                v.insert(AnyMeter::MaxGauge(m.clone()));
                m
            }
        }
    }

    /// Get or create the long task timer for `id`.
    pub fn long_task_timer(&self, id: Id) -> LongTaskTimer {
        match self.inner.meters.entry(id) {
            Entry::Occupied(e) => match e.get() {
                AnyMeter::LongTaskTimer(m) => m.clone(),
                other => {
                    self.report_mismatch(e.key(), MeterKind::LongTaskTimer, other.kind());
                    LongTaskTimer::noop()
                }
            },
            Entry::Vacant(v) => {
                let m = LongTaskTimer::new(
                    v.key().clone(),
                    self.inner.clock.clone(),
                    self.inner.step,
                    self.inner.ttl,
                );
                v.insert(AnyMeter::LongTaskTimer(m.clone()));
                m
            }
        }
    }

    /// Register a user-provided meter. Keeps the existing binding and
    /// reports a mismatch if the id is already in use.
    pub fn register(&self, meter: Arc<dyn Meter>) {
        match self.inner.meters.entry(meter.id().clone()) {
            Entry::Occupied(e) => {
                self.report_mismatch(e.key(), MeterKind::Custom, e.get().kind());
            }
            Entry::Vacant(v) => {
                v.insert(AnyMeter::Custom(meter));
            }
        }
    }

    fn report_mismatch(&self, id: &Id, requested: MeterKind, existing: MeterKind) {
        (self.inner.on_type_mismatch)(id, requested, existing);
    }

    /// Number of registered meters.
    pub fn len(&self) -> usize {
        self.inner.meters.len()
    }

    /// True when no meters are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.meters.is_empty()
    }

    /// Sample every non-expired meter at the current clock time. The
    /// per-meter sampling is lazy; the meter list is captured eagerly so
    /// the iterator does not hold any map locks.
    pub fn measurements(&self) -> impl Iterator<Item = Measurement> {
        let meters: Vec<AnyMeter> = self
            .inner
            .meters
            .iter()
            .filter(|e| !e.value().as_meter().has_expired())
            .map(|e| e.value().clone())
            .collect();
        meters.into_iter().flat_map(|m| m.as_meter().measure())
    }

    /// Drop meters whose TTL has lapsed. Returns how many were removed.
    pub fn remove_expired(&self) -> usize {
        let before = self.inner.meters.len();
        self.inner.meters.retain(|_, m| !m.as_meter().has_expired());
        before - self.inner.meters.len()
    }

    /// User-accessible state map for caching objects derived from meters,
    /// e.g. percentile bucket counters.
    pub fn state(&self) -> &DashMap<Id, Arc<dyn Any + Send + Sync>> {
        &self.inner.state
    }

    /// Fetch or initialize a typed entry in the state map. If the id is
    /// bound to state of a different type the entry is left alone and a
    /// fresh unshared value is returned.
    pub fn state_get_or_init<T: Send + Sync + 'static>(
        &self,
        id: &Id,
        init: impl Fn() -> Arc<T>,
    ) -> Arc<T> {
        let entry = self
            .inner
            .state
            .entry(id.clone())
            .or_insert_with(|| {
                let state: Arc<dyn Any + Send + Sync> = init();
                state
            })
            .clone();
        match entry.downcast::<T>() {
            Ok(v) => v,
            Err(_) => {
                atlas_log!(warn, name: "Registry.state", id = id.to_string(), message = "state type mismatch");
                init()
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::builder().build()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("meters", &self.inner.meters.len())
            .field("step", &self.inner.step)
            .finish()
    }
}

/// Configures and creates a [`Registry`].
pub struct RegistryBuilder {
    clock: Arc<dyn Clock>,
    step: u64,
    ttl: u64,
    on_type_mismatch: TypeMismatchHandler,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        RegistryBuilder {
            clock: Arc::new(SystemClock::new()),
            step: DEFAULT_STEP,
            ttl: DEFAULT_METER_TTL,
            on_type_mismatch: Arc::new(|id, requested, existing| {
                atlas_log!(warn,
                    name: "Registry.typeMismatch",
                    id = id.to_string(),
                    requested = format!("{requested:?}"),
                    existing = format!("{existing:?}")
                );
            }),
        }
    }
}

impl RegistryBuilder {
    /// Use the given time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Primary step size in milliseconds.
    pub fn with_step(mut self, step: u64) -> Self {
        if step > 0 {
            self.step = step;
        }
        self
    }

    /// Meter TTL in milliseconds of inactivity.
    pub fn with_meter_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Handler invoked on meter type mismatches.
    pub fn with_type_mismatch_handler(mut self, handler: TypeMismatchHandler) -> Self {
        self.on_type_mismatch = handler;
        self
    }

    /// Create the registry.
    pub fn build(self) -> Registry {
        Registry {
            inner: Arc::new(RegistryInner {
                clock: self.clock,
                step: self.step,
                ttl: self.ttl,
                meters: DashMap::new(),
                state: DashMap::new(),
                on_type_mismatch: self.on_type_mismatch,
            }),
        }
    }
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("step", &self.step)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_registry() -> (Arc<ManualClock>, Registry) {
        let clock = Arc::new(ManualClock::new());
        let registry = Registry::builder().with_clock(clock.clone()).build();
        (clock, registry)
    }

    #[test]
    fn lookup_is_idempotent() {
        let (_, registry) = test_registry();
        let a = registry.counter(Id::new("x"));
        let b = registry.counter(Id::new("x"));
        a.increment();
        b.increment();
        assert_eq!(a.actual_count(), 2.0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn type_mismatch_returns_noop_and_keeps_binding() {
        let mismatches = Arc::new(AtomicUsize::new(0));
        let seen = mismatches.clone();
        let registry = Registry::builder()
            .with_type_mismatch_handler(Arc::new(move |_, requested, existing| {
                assert_eq!(requested, MeterKind::Timer);
                assert_eq!(existing, MeterKind::Counter);
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .build();
        let c = registry.counter(Id::new("x"));
        let t = registry.timer(Id::new("x"));
        assert!(t.is_noop());
        t.record(std::time::Duration::from_secs(1));
        assert_eq!(mismatches.load(Ordering::SeqCst), 1);
        // original counter still works
        c.increment();
        assert_eq!(c.actual_count(), 1.0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn measurements_cover_all_meters() {
        let (clock, registry) = test_registry();
        registry.counter(Id::new("a")).increment();
        registry.gauge(Id::new("b")).set(3.0);
        clock.set_wall_time(5_000);
        let ms: Vec<_> = registry.measurements().collect();
        // one counter statistic plus one gauge statistic
        assert_eq!(ms.len(), 2);
    }

    #[test]
    fn expired_meters_are_swept() {
        let (clock, registry) = test_registry();
        registry.counter(Id::new("a")).increment();
        registry.counter(Id::new("b"));
        clock.set_wall_time(DEFAULT_METER_TTL + 1_000);
        assert_eq!(registry.remove_expired(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn custom_meter_registration() {
        use crate::meter::Meter;

        struct Fixed(Id);
        impl Meter for Fixed {
            fn id(&self) -> &Id {
                &self.0
            }
            fn measure(&self) -> Vec<Measurement> {
                vec![Measurement::new(self.0.clone(), 0, 1.0)]
            }
            fn has_expired(&self) -> bool {
                false
            }
        }

        let (_, registry) = test_registry();
        registry.register(Arc::new(Fixed(Id::new("custom"))));
        assert_eq!(registry.len(), 1);
        let ms: Vec<_> = registry.measurements().collect();
        assert_eq!(ms.len(), 1);
    }
}
