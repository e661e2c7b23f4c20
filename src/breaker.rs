//! Module K — Circuit Breakers & Posture.
//!
//! `NORMAL -> DEFENSIVE -> HALTED`, generalized from the teacher's
//! `risk::DrawdownMonitor` throttle hysteresis and `main.rs`'s
//! `DataSourceKillSwitch` trip-on-threshold-breach pattern. Transitions are
//! monotone except for a manual operator reset, which additionally requires
//! the triggering condition to have cleared for `hysteresis_window`
//! (spec.md §4.K).

use std::time::Instant;

use crate::model::Posture;

/// Thresholds driving posture transitions, loaded from the risk policy /
/// runtime config (spec.md §4.K names each default).
#[derive(Debug, Clone, Copy)]
pub struct BreakerThresholds {
    pub defensive_dd: f64,
    pub halt_dd: f64,
    pub defensive_truth: u8,
    pub halt_truth: u8,
    pub defensive_quality: f64,
    pub defensive_tail: f64,
    pub daily_limit: f64,
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        Self {
            defensive_dd: 0.02,
            halt_dd: 0.05,
            defensive_truth: 70,
            halt_truth: 40,
            defensive_quality: 0.6,
            defensive_tail: 3.0,
            daily_limit: 0.05,
        }
    }
}

/// Inputs evaluated on each tick to decide whether posture should change.
#[derive(Debug, Clone, Copy)]
pub struct BreakerInputs {
    pub drawdown_pct: f64,
    pub truth_score: u8,
    pub venue_quality_score: f64,
    pub tail_risk: f64,
    pub daily_loss_pct: f64,
    pub operator_halt: bool,
}

pub struct PostureTracker {
    posture: Posture,
    thresholds: BreakerThresholds,
    hysteresis_window: std::time::Duration,
    cleared_since: Option<Instant>,
}

impl PostureTracker {
    pub fn new(thresholds: BreakerThresholds, hysteresis_window: std::time::Duration) -> Self {
        Self { posture: Posture::Normal, thresholds, hysteresis_window, cleared_since: None }
    }

    pub fn posture(&self) -> Posture {
        self.posture
    }

    fn is_clear(&self, inputs: &BreakerInputs) -> bool {
        !inputs.operator_halt
            && inputs.drawdown_pct <= self.thresholds.defensive_dd
            && inputs.truth_score >= self.thresholds.defensive_truth
            && inputs.venue_quality_score >= self.thresholds.defensive_quality
            && inputs.tail_risk <= self.thresholds.defensive_tail
    }

    /// Evaluates one tick of breaker inputs and updates posture accordingly.
    /// Returns the resulting posture.
    pub fn evaluate(&mut self, inputs: &BreakerInputs) -> Posture {
        let should_halt = inputs.operator_halt
            || inputs.drawdown_pct > self.thresholds.halt_dd
            || inputs.truth_score < self.thresholds.halt_truth
            || inputs.daily_loss_pct > self.thresholds.daily_limit;

        let should_defend = inputs.drawdown_pct > self.thresholds.defensive_dd
            || inputs.truth_score < self.thresholds.defensive_truth
            || inputs.venue_quality_score < self.thresholds.defensive_quality
            || inputs.tail_risk > self.thresholds.defensive_tail;

        match self.posture {
            Posture::Normal => {
                if should_halt {
                    self.posture = Posture::Halted;
                } else if should_defend {
                    self.posture = Posture::Defensive;
                }
            }
            Posture::Defensive => {
                if should_halt {
                    self.posture = Posture::Halted;
                }
                // Defensive never self-heals to Normal; only an operator ARM
                // after sustained clearance does (see `try_reset`).
            }
            Posture::Halted => {
                // Halted only clears via `try_reset`.
            }
        }

        if self.is_clear(inputs) {
            self.cleared_since.get_or_insert_with(Instant::now);
        } else {
            self.cleared_since = None;
        }

        self.posture
    }

    /// Operator-initiated ARM: resets to NORMAL only if the triggering
    /// condition has been clear for at least `hysteresis_window`
    /// (spec.md §4.K).
    pub fn try_reset(&mut self) -> Result<(), &'static str> {
        match self.cleared_since {
            Some(since) if since.elapsed() >= self.hysteresis_window => {
                self.posture = Posture::Normal;
                self.cleared_since = None;
                Ok(())
            }
            Some(_) => Err("triggering condition has not cleared for the full hysteresis window"),
            None => Err("triggering condition has not cleared"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_inputs() -> BreakerInputs {
        BreakerInputs { drawdown_pct: 0.0, truth_score: 100, venue_quality_score: 1.0, tail_risk: 0.0, daily_loss_pct: 0.0, operator_halt: false }
    }

    #[test]
    fn normal_to_defensive_on_drawdown_breach() {
        let mut tracker = PostureTracker::new(BreakerThresholds::default(), std::time::Duration::from_secs(300));
        let mut inputs = ok_inputs();
        inputs.drawdown_pct = 0.03;
        assert_eq!(tracker.evaluate(&inputs), Posture::Defensive);
    }

    #[test]
    fn defensive_to_halted_on_further_breach() {
        let mut tracker = PostureTracker::new(BreakerThresholds::default(), std::time::Duration::from_secs(300));
        let mut inputs = ok_inputs();
        inputs.drawdown_pct = 0.03;
        tracker.evaluate(&inputs);
        inputs.drawdown_pct = 0.06;
        assert_eq!(tracker.evaluate(&inputs), Posture::Halted);
    }

    #[test]
    fn reset_fails_before_hysteresis_window_elapses() {
        let mut tracker = PostureTracker::new(BreakerThresholds::default(), std::time::Duration::from_secs(300));
        tracker.evaluate(&ok_inputs());
        assert!(tracker.try_reset().is_err());
    }

    #[test]
    fn reset_succeeds_after_hysteresis_window_elapses() {
        let mut tracker = PostureTracker::new(BreakerThresholds::default(), std::time::Duration::from_millis(5));
        let mut inputs = ok_inputs();
        inputs.drawdown_pct = 0.1;
        tracker.evaluate(&inputs);
        assert_eq!(tracker.posture(), Posture::Halted);

        tracker.evaluate(&ok_inputs());
        std::thread::sleep(std::time::Duration::from_millis(10));
        tracker.evaluate(&ok_inputs());
        assert!(tracker.try_reset().is_ok());
        assert_eq!(tracker.posture(), Posture::Normal);
    }

    #[test]
    fn operator_halt_forces_halted_regardless_of_metrics() {
        let mut tracker = PostureTracker::new(BreakerThresholds::default(), std::time::Duration::from_secs(300));
        let mut inputs = ok_inputs();
        inputs.operator_halt = true;
        assert_eq!(tracker.evaluate(&inputs), Posture::Halted);
    }
}
