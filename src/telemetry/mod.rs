//! Ambient telemetry primitives shared across components. Deliberately
//! in-process only: no exporter is carried here (metrics exporters are out
//! of scope), this feeds gates and the status surface directly.

pub mod histogram;

pub use histogram::LatencyHistogram;
