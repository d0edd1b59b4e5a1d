//! Wall and monotonic time sources.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

/// Base instant for the monotonic clock, captured once per process.
static MONOTONIC_BASE: Lazy<Instant> = Lazy::new(Instant::now);

/// A source of wall and monotonic time.
///
/// Wall time is milliseconds since the unix epoch and is used for step
/// boundaries and measurement timestamps. Monotonic time is nanoseconds from
/// an arbitrary origin and is only meaningful for measuring elapsed time.
pub trait Clock: Send + Sync + 'static {
    /// Current wall time in milliseconds since the epoch.
    fn wall_time(&self) -> u64;

    /// Current monotonic time in nanoseconds.
    fn monotonic_time(&self) -> u64;
}

/// Clock implementation backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        SystemClock
    }
}

impl Clock for SystemClock {
    fn wall_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn monotonic_time(&self) -> u64 {
        MONOTONIC_BASE.elapsed().as_nanos() as u64
    }
}

/// Clock that only advances when told to. Used to get deterministic step
/// transitions in tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    wall: AtomicU64,
    monotonic: AtomicU64,
}

impl ManualClock {
    /// Create a clock with both times at zero.
    pub fn new() -> Self {
        ManualClock::default()
    }

    /// Set the wall time in milliseconds.
    pub fn set_wall_time(&self, millis: u64) {
        self.wall.store(millis, Ordering::Relaxed);
    }

    /// Set the monotonic time in nanoseconds.
    pub fn set_monotonic_time(&self, nanos: u64) {
        self.monotonic.store(nanos, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn wall_time(&self) -> u64 {
        self.wall.load(Ordering::Relaxed)
    }

    fn monotonic_time(&self) -> u64 {
        self.monotonic.load(Ordering::Relaxed)
    }
}

impl fmt::Display for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ManualClock(wall={}, monotonic={})",
            self.wall.load(Ordering::Relaxed),
            self.monotonic.load(Ordering::Relaxed)
        )
    }
}
