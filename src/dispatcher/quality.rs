//! Per-venue latency/slippage quality tracking (SPEC_FULL.md §0.5), grounded
//! on the teacher's `performance::venue::VenueLatencyTracker`. This is the
//! concrete mechanism behind gate 10 (venue quality) and the ack-latency
//! input to the Truth Score.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

use crate::risk::VenueQualitySnapshot;
use crate::telemetry::LatencyHistogram;

#[derive(Default)]
struct VenueMetrics {
    ack_latency: LatencyHistogram,
    fill_latency: LatencyHistogram,
    slippage_bps_sum: f64,
    slippage_samples: u64,
    rejects: u64,
    connects: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VenueQualityReport {
    pub venue: String,
    pub ack_latency_p50_ms: f64,
    pub ack_latency_p99_ms: f64,
    pub avg_slippage_bps: f64,
    pub rejects: u64,
    pub connects: u64,
}

pub struct VenueQualityTracker {
    venues: RwLock<HashMap<String, VenueMetrics>>,
    max_slippage_bps: f64,
    max_ack_latency_ms: f64,
}

impl VenueQualityTracker {
    pub fn new(max_slippage_bps: f64, max_ack_latency_ms: f64) -> Self {
        Self { venues: RwLock::new(HashMap::new()), max_slippage_bps, max_ack_latency_ms }
    }

    fn ensure(&self, venue: &str) {
        self.venues.write().entry(venue.to_string()).or_default();
    }

    pub fn record_ack(&self, venue: &str, latency: std::time::Duration) {
        self.ensure(venue);
        self.venues.read().get(venue).unwrap().ack_latency.record_duration(latency);
    }

    pub fn record_fill(&self, venue: &str, latency: std::time::Duration, slippage_bps: f64) {
        self.ensure(venue);
        let venues = self.venues.read();
        let metrics = venues.get(venue).unwrap();
        metrics.fill_latency.record_duration(latency);
        // slippage_bps_sum/slippage_samples are not behind the RwLock's
        // interior mutability story for floats without a Mutex; take the
        // write lock briefly instead.
        drop(venues);
        let mut venues = self.venues.write();
        let metrics = venues.get_mut(venue).unwrap();
        metrics.slippage_bps_sum += slippage_bps;
        metrics.slippage_samples += 1;
    }

    pub fn record_reject(&self, venue: &str) {
        self.ensure(venue);
        self.venues.write().get_mut(venue).unwrap().rejects += 1;
    }

    pub fn record_connect(&self, venue: &str) {
        self.ensure(venue);
        self.venues.write().get_mut(venue).unwrap().connects += 1;
    }

    /// Snapshot used directly as gate 10's input.
    pub fn snapshot_for_gate(&self, venue: &str) -> VenueQualitySnapshot {
        self.ensure(venue);
        let venues = self.venues.read();
        let metrics = venues.get(venue).unwrap();
        let avg_slippage = if metrics.slippage_samples == 0 {
            0.0
        } else {
            metrics.slippage_bps_sum / metrics.slippage_samples as f64
        };
        VenueQualitySnapshot {
            slippage_bps: avg_slippage,
            ack_latency_ms: metrics.ack_latency.p50_us() as f64 / 1000.0,
            max_slippage_bps: self.max_slippage_bps,
            max_ack_latency_ms: self.max_ack_latency_ms,
        }
    }

    pub fn report(&self, venue: &str) -> VenueQualityReport {
        self.ensure(venue);
        let venues = self.venues.read();
        let metrics = venues.get(venue).unwrap();
        let avg_slippage = if metrics.slippage_samples == 0 {
            0.0
        } else {
            metrics.slippage_bps_sum / metrics.slippage_samples as f64
        };
        VenueQualityReport {
            venue: venue.to_string(),
            ack_latency_p50_ms: metrics.ack_latency.p50_us() as f64 / 1000.0,
            ack_latency_p99_ms: metrics.ack_latency.p99_us() as f64 / 1000.0,
            avg_slippage_bps: avg_slippage,
            rejects: metrics.rejects,
            connects: metrics.connects,
        }
    }

    pub fn all_reports(&self) -> Vec<VenueQualityReport> {
        let names: Vec<String> = self.venues.read().keys().cloned().collect();
        names.iter().map(|v| self.report(v)).collect()
    }

    /// Fraction of tracked venues currently within the slippage/latency
    /// thresholds, fed to the posture tracker as `venue_quality_score`
    /// (spec.md §4.K). `1.0` (healthy) when no venue has traded yet.
    pub fn quality_score(&self) -> f64 {
        let venues = self.venues.read();
        if venues.is_empty() {
            return 1.0;
        }
        let healthy = venues
            .values()
            .filter(|m| {
                let avg_slippage = if m.slippage_samples == 0 {
                    0.0
                } else {
                    m.slippage_bps_sum / m.slippage_samples as f64
                };
                let ack_ms = m.ack_latency.p50_us() as f64 / 1000.0;
                avg_slippage <= self.max_slippage_bps && ack_ms <= self.max_ack_latency_ms
            })
            .count();
        healthy as f64 / venues.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_snapshot_reflects_recorded_slippage() {
        let tracker = VenueQualityTracker::new(10.0, 200.0);
        tracker.record_fill("binance", std::time::Duration::from_millis(5), 50.0);
        let snap = tracker.snapshot_for_gate("binance");
        assert_eq!(snap.slippage_bps, 50.0);
        assert!(snap.slippage_bps > snap.max_slippage_bps);
    }

    #[test]
    fn unknown_venue_reports_zeroed_defaults() {
        let tracker = VenueQualityTracker::new(10.0, 200.0);
        let report = tracker.report("unseen");
        assert_eq!(report.rejects, 0);
        assert_eq!(report.avg_slippage_bps, 0.0);
    }
}
