//! Module E — Risk & Safety Gate Chain. See [`gates::evaluate`] for the
//! ordered eleven-gate pipeline; the rest of this module is data shared with
//! callers (the lifecycle engine, the status surface).

pub mod gates;

pub use gates::{evaluate, evaluate_flatten, GateContext, GateDecision, L2Snapshot, VenueQualitySnapshot};
