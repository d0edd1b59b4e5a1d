//! In-process metrics aggregation with step-aligned reporting.
//!
//! This crate provides the meter primitives and the registry that owns them.
//! Application code records measurements through [`Counter`], [`Timer`],
//! [`DistributionSummary`] and the gauge types; every primitive accumulates
//! into lock-free step buckets so that each reporting interval yields one
//! complete, normalized value per meter. The publish pipeline built on top of
//! this crate lives in `atlas-publish`.
//!
//! # Getting started
//!
//! ```
//! use atlas_metrics::{Registry, Id};
//!
//! let registry = Registry::builder().build();
//! let requests = registry.counter(Id::new("server.requests").with_tag("status", "2xx"));
//! requests.increment();
//! ```
//!
//! Meter updates are wait-free and safe to perform from any thread. Reading
//! happens on step boundaries through [`Registry::measurements`].

#![warn(missing_debug_implementations)]

pub mod atomic;
pub mod clock;
pub mod id;
mod internal_logging;
pub mod measurement;
pub mod meter;
pub mod polled;
pub mod registry;
pub mod scheduler;
pub mod step;
pub mod util;

pub use clock::{Clock, ManualClock, SystemClock};
pub use id::{Id, Tag};
pub use measurement::Measurement;
pub use meter::{
    Counter, DistributionSummary, Gauge, LongTaskTimer, MaxGauge, Meter, MeterKind,
    PercentileDistributionSummary, PercentileTimer, Statistic,
};
pub use polled::PolledMeter;
pub use registry::{Registry, RegistryBuilder};
pub use scheduler::{RepeatPolicy, Scheduler, SchedulerOptions, TaskHandle, TaskPhase};
