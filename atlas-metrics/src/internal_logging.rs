//! Macro for the library's own diagnostics.
//!
//! Intended for use inside the atlas crates, not for application logging.
//! Events carry a `name:` identifying the operation plus optional
//! key/value fields and forward to `tracing` at the given level when the
//! `internal-logs` feature is enabled; with the feature off the macro
//! compiles to nothing, so the hot path never pays for a disabled
//! subscriber.
//!
//! ```
//! use atlas_metrics::atlas_log;
//! atlas_log!(warn, name: "Registry.typeMismatch", id = "server.requests");
//! ```
#[macro_export]
macro_rules! atlas_log {
    ($level:ident, name: $name:expr $(, $key:ident = $value:expr)* $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            tracing::$level!(name: $name, target: env!("CARGO_PKG_NAME"), $($key = $value,)* "");
        }
        #[cfg(not(feature = "internal-logs"))]
        {
            let _ = ($name $(, $value)*);
        }
    };
}
