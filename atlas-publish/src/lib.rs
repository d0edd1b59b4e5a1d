//! Publish pipeline for the Atlas backend.
//!
//! On each primary step this crate snapshots the registry, applies the
//! rollup policy, feeds per-meter consolidators, and on publish step
//! boundaries posts the batched payload to the publish endpoint while
//! evaluating every measurement against the currently subscribed streaming
//! expressions.
//!
//! The HTTP client is pluggable through [`HttpClient`]; ready-made reqwest
//! implementations are available behind the `reqwest-client` and
//! `reqwest-blocking-client` features.

#![warn(missing_debug_implementations)]

pub mod config;
pub mod consolidator;
pub mod http;
pub mod payload;
pub mod publisher;
pub mod rollup;
pub mod subscriptions;

pub use config::{Config, ConfigBuilder, ConfigError};
pub use consolidator::Consolidator;
pub use http::{HttpClient, HttpError, RetryPolicy};
pub use publisher::Publisher;
pub use rollup::{RollupAction, RollupPolicy, RollupRule};
pub use subscriptions::{Subscription, SubscriptionManager};
