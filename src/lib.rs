//! Titan core library.
//!
//! Exposes the execution-fabric modules for use by `main` and by tests.

pub mod allocator;
pub mod api;
pub mod breaker;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod eventlog;
pub mod lifecycle;
pub mod model;
pub mod operator;
pub mod orchestrator;
pub mod risk;
pub mod shadow;
pub mod telemetry;
pub mod transport;
pub mod truth;

/// Milliseconds since the Unix epoch. The one place the crate touches wall
/// clock time outside of `chrono`, so every caller observes the same source.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
