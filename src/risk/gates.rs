//! The eleven ordered, fail-closed gates of spec.md §4.E. Each gate is a pure
//! function of `(intent, snapshot, context)`: no I/O, no mutation. Side
//! effects (budget reservation, event append) happen only once every gate
//! has passed, in the lifecycle engine.

use crate::config::RiskPolicy;
use crate::error::GateError;
use crate::model::{Budget, BudgetState, Intent, Posture};
use crate::shadow::ShadowSnapshot;

/// Best-of-book liquidity as observed at PREPARE time (spec.md §4.E.9).
#[derive(Debug, Clone, Copy)]
pub struct L2Snapshot {
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_depth: f64,
    pub ask_depth: f64,
}

impl L2Snapshot {
    fn spread_bps(&self) -> f64 {
        if self.best_bid <= 0.0 {
            return f64::MAX;
        }
        (self.best_ask - self.best_bid) / self.best_bid * 10_000.0
    }

    fn top_of_book_depth(&self) -> f64 {
        self.bid_depth.min(self.ask_depth)
    }
}

/// Rolling venue-quality inputs (see [`crate::dispatcher::quality`]).
#[derive(Debug, Clone, Copy)]
pub struct VenueQualitySnapshot {
    pub slippage_bps: f64,
    pub ack_latency_ms: f64,
    pub max_slippage_bps: f64,
    pub max_ack_latency_ms: f64,
}

impl VenueQualitySnapshot {
    fn degraded(&self) -> bool {
        self.slippage_bps > self.max_slippage_bps || self.ack_latency_ms > self.max_ack_latency_ms
    }
}

/// Everything the gate chain needs beyond the intent and shadow snapshot.
/// All-reference/Copy fields so callers (e.g. the FLATTEN path) can derive a
/// modified context cheaply via struct-update syntax.
#[derive(Clone, Copy)]
pub struct GateContext<'a> {
    pub policy: &'a RiskPolicy,
    pub active_policy_hash: &'a str,
    pub armed: bool,
    pub posture: Posture,
    pub truth_score: u8,
    pub min_truth_for_new_risk: u8,
    pub budget: Option<&'a Budget>,
    pub orders_this_minute_for_producer: u32,
    pub l2: &'a L2Snapshot,
    pub venue: &'a str,
    pub venue_quality: &'a VenueQualitySnapshot,
    pub venue_degraded_rejects: bool,
}

/// Outcome of a successful run through the chain: the (possibly reduced)
/// approved size, and whether DEFENSIVE posture halved it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateDecision {
    pub approved_size: f64,
    pub defensive_halved: bool,
}

/// Runs the gate chain for a normal intent, in order 1 through 11.
pub fn evaluate(
    intent: &Intent,
    snapshot: &ShadowSnapshot,
    ctx: &GateContext,
    bypass_truth_gate: bool,
) -> Result<GateDecision, GateError> {
    evaluate_inner(intent, snapshot, ctx, bypass_truth_gate, false, false)
}

/// Runs the gate chain for a `FLATTEN`-originated synthetic close intent:
/// bypasses the budget gate (5) per spec.md §4.J ("bypass of budget gates
/// but not risk math") as well as the Truth gate (6), per Open Question 1.
/// A close intent also has no stop loss of its own, so gate 11's
/// stop-distance sub-check is skipped; the symbol-cap and leverage
/// sub-checks still apply.
pub fn evaluate_flatten(
    intent: &Intent,
    snapshot: &ShadowSnapshot,
    ctx: &GateContext,
) -> Result<GateDecision, GateError> {
    evaluate_inner(intent, snapshot, ctx, true, true, true)
}

fn evaluate_inner(
    intent: &Intent,
    snapshot: &ShadowSnapshot,
    ctx: &GateContext,
    bypass_truth_gate: bool,
    bypass_budget_gate: bool,
    is_close: bool,
) -> Result<GateDecision, GateError> {
    // 1. ARM state.
    if !ctx.armed {
        return Err(GateError::SystemDisarmed);
    }

    // 2. Signature & freshness are enforced by the codec before the gate
    // chain is invoked; nothing to check here.

    // 3. Policy hash parity.
    if intent.policy_hash != ctx.active_policy_hash {
        return Err(GateError::PolicyMismatch);
    }

    // 4. Allowed venue/symbol.
    if !ctx.policy.allowed_venues.iter().any(|v| v == ctx.venue) {
        return Err(GateError::VenueForbidden(ctx.venue.to_string()));
    }
    if !ctx.policy.allowed_symbols.iter().any(|s| s == &intent.symbol) {
        return Err(GateError::SymbolForbidden(intent.symbol.clone()));
    }

    // 5. Budget & sizing.
    if !bypass_budget_gate {
        let budget = ctx.budget.ok_or(GateError::BudgetExceeded)?;
        if !matches!(budget.state, BudgetState::Active | BudgetState::Throttled) {
            return Err(GateError::BudgetExceeded);
        }
        let max_trade_size = budget.allocated_equity * ctx.policy.max_per_trade_risk_fraction;
        if intent.requested_size > max_trade_size {
            return Err(GateError::BudgetExceeded);
        }
    }

    // 6. Truth gate.
    if !bypass_truth_gate && ctx.truth_score < ctx.min_truth_for_new_risk {
        return Err(GateError::TruthDegraded { truth: ctx.truth_score, min: ctx.min_truth_for_new_risk });
    }

    // 7. Circuit breaker posture.
    let mut size = intent.requested_size;
    let mut defensive_halved = false;
    match ctx.posture {
        Posture::Halted => return Err(GateError::SystemHalted),
        Posture::Defensive => {
            size *= 0.5;
            defensive_halved = true;
        }
        Posture::Normal => {}
    }

    // 8. Rate limit.
    if ctx.orders_this_minute_for_producer >= ctx.policy.max_orders_per_minute {
        return Err(GateError::RateLimited(intent.source.clone()));
    }

    // 9. L2 liquidity.
    if ctx.l2.best_bid <= 0.0 || ctx.l2.best_ask <= 0.0 {
        return Err(GateError::LiquidityInsufficient("no two-sided book".to_string()));
    }
    if ctx.l2.spread_bps() > ctx.policy.max_spread_bps {
        return Err(GateError::LiquidityInsufficient(format!(
            "spread {:.2}bps exceeds max {:.2}bps",
            ctx.l2.spread_bps(),
            ctx.policy.max_spread_bps
        )));
    }
    if ctx.l2.top_of_book_depth() < ctx.policy.min_depth_multiple * size {
        return Err(GateError::LiquidityInsufficient("top-of-book depth below required multiple".to_string()));
    }

    // 10. Venue quality.
    if ctx.venue_quality.degraded() {
        if ctx.venue_degraded_rejects {
            return Err(GateError::VenueDegraded {
                venue: ctx.venue.to_string(),
                reason: format!(
                    "slippage={:.2}bps ack_latency={:.1}ms",
                    ctx.venue_quality.slippage_bps, ctx.venue_quality.ack_latency_ms
                ),
            });
        }
        size *= 0.5;
    }

    // 11. Risk math.
    let symbol_cap = ctx
        .policy
        .max_position_per_symbol
        .get(&intent.symbol)
        .copied()
        .unwrap_or(f64::MAX);
    if size > symbol_cap {
        return Err(GateError::RiskCapExceeded(format!("size {size} exceeds per-symbol cap {symbol_cap}")));
    }
    if intent.leverage > ctx.policy.max_aggregate_leverage {
        return Err(GateError::RiskCapExceeded(format!(
            "leverage {} exceeds aggregate cap {}",
            intent.leverage, ctx.policy.max_aggregate_leverage
        )));
    }
    // A close intent has no stop loss of its own, so skip the sub-check.
    if !is_close {
        let stop_distance_bps = match intent.side {
            crate::model::Side::Long => (intent.entry_zone.0 - intent.stop_loss) / intent.entry_zone.0 * 10_000.0,
            crate::model::Side::Short => (intent.stop_loss - intent.entry_zone.1) / intent.entry_zone.1 * 10_000.0,
        };
        if stop_distance_bps < ctx.policy.min_stop_loss_distance_bps {
            return Err(GateError::RiskCapExceeded(format!(
                "stop distance {stop_distance_bps:.1}bps below minimum {}bps",
                ctx.policy.min_stop_loss_distance_bps
            )));
        }
    }
    if let Some(budget) = ctx.budget {
        let projected_daily_loss = snapshot.daily.loss + size * ctx.policy.max_per_trade_risk_fraction;
        if projected_daily_loss > ctx.policy.daily_drawdown_limit * budget.allocated_equity {
            return Err(GateError::RiskCapExceeded("projected daily loss exceeds policy limit".to_string()));
        }
    }

    Ok(GateDecision { approved_size: size, defensive_halved })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Regime, Side};
    use std::collections::BTreeMap;

    fn policy() -> RiskPolicy {
        let mut max_position_per_symbol = BTreeMap::new();
        max_position_per_symbol.insert("BTCUSDT".to_string(), 50_000.0);
        RiskPolicy {
            max_position_per_symbol,
            max_aggregate_leverage: 5.0,
            max_per_trade_risk_fraction: 0.5,
            daily_drawdown_limit: 0.05,
            minimum_equity: 1_000.0,
            emergency_stop_loss_threshold: 0.1,
            allowed_venues: vec!["binance".to_string()],
            allowed_symbols: vec!["BTCUSDT".to_string()],
            max_orders_per_minute: 60,
            max_spread_bps: 10.0,
            min_depth_multiple: 1.0,
            min_stop_loss_distance_bps: 20.0,
        }
    }

    fn intent() -> Intent {
        Intent {
            intent_id: "I1".to_string(),
            source: "phase-a".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            entry_zone: (50_000.0, 50_100.0),
            stop_loss: 49_000.0,
            take_profits: vec![51_000.0],
            leverage: 2.0,
            requested_size: 1_000.0,
            confidence: 0.8,
            policy_hash: "H".to_string(),
            correlation_id: "corr-1".to_string(),
            created_at: 0,
        }
    }

    fn budget() -> Budget {
        Budget {
            phase: "phase-a".to_string(),
            allocated_equity: 10_000.0,
            state: BudgetState::Active,
            regime: Regime::Stable,
            issued_at: 0,
        }
    }

    fn l2() -> L2Snapshot {
        L2Snapshot { best_bid: 50_000.0, best_ask: 50_005.0, bid_depth: 10_000.0, ask_depth: 10_000.0 }
    }

    fn venue_quality() -> VenueQualitySnapshot {
        VenueQualitySnapshot { slippage_bps: 1.0, ack_latency_ms: 50.0, max_slippage_bps: 20.0, max_ack_latency_ms: 500.0 }
    }

    fn snapshot() -> ShadowSnapshot {
        ShadowSnapshot {
            intents: Default::default(),
            positions: Default::default(),
            daily: Default::default(),
        }
    }

    fn ctx<'a>(policy: &'a RiskPolicy, budget: &'a Budget, l2: &'a L2Snapshot, vq: &'a VenueQualitySnapshot) -> GateContext<'a> {
        GateContext {
            policy,
            active_policy_hash: "H",
            armed: true,
            posture: Posture::Normal,
            truth_score: 100,
            min_truth_for_new_risk: 70,
            budget: Some(budget),
            orders_this_minute_for_producer: 0,
            l2,
            venue: "binance",
            venue_quality: vq,
            venue_degraded_rejects: false,
        }
    }

    #[test]
    fn happy_path_passes_all_gates() {
        let (policy, budget, l2, vq) = (policy(), budget(), l2(), venue_quality());
        let decision = evaluate(&intent(), &snapshot(), &ctx(&policy, &budget, &l2, &vq), false).unwrap();
        assert_eq!(decision.approved_size, 1_000.0);
        assert!(!decision.defensive_halved);
    }

    #[test]
    fn flatten_bypasses_budget_gate_with_no_budget() {
        let (policy, l2, vq) = (policy(), l2(), venue_quality());
        let mut c = ctx(&policy, &budget(), &l2, &vq);
        c.budget = None;
        c.truth_score = 0;
        let decision = evaluate_flatten(&intent(), &snapshot(), &c).unwrap();
        assert_eq!(decision.approved_size, 1_000.0);
    }

    #[test]
    fn flatten_close_intent_clears_gate_despite_zero_stop_distance() {
        // Mirrors lifecycle::flatten_all's synthetic close intent: entry_zone
        // collapsed to a single price and stop_loss equal to it, so a normal
        // `evaluate` call would fail gate 11's stop-distance check.
        let (policy, l2, vq) = (policy(), l2(), venue_quality());
        let mut c = ctx(&policy, &budget(), &l2, &vq);
        c.budget = None;
        let mut close = intent();
        close.entry_zone = (50_000.0, 50_000.0);
        close.stop_loss = 50_000.0;

        assert!(evaluate(&close, &snapshot(), &c, false).is_err());
        let decision = evaluate_flatten(&close, &snapshot(), &c).unwrap();
        assert_eq!(decision.approved_size, 1_000.0);
    }

    #[test]
    fn disarmed_rejects_before_any_other_gate() {
        let (policy, budget, l2, vq) = (policy(), budget(), l2(), venue_quality());
        let mut c = ctx(&policy, &budget, &l2, &vq);
        c.armed = false;
        let err = evaluate(&intent(), &snapshot(), &c, false).unwrap_err();
        assert_eq!(err, GateError::SystemDisarmed);
    }

    #[test]
    fn policy_hash_mismatch_rejects() {
        let (policy, budget, l2, vq) = (policy(), budget(), l2(), venue_quality());
        let mut i = intent();
        i.policy_hash = "OTHER".to_string();
        let err = evaluate(&i, &snapshot(), &ctx(&policy, &budget, &l2, &vq), false).unwrap_err();
        assert_eq!(err, GateError::PolicyMismatch);
    }

    #[test]
    fn defensive_posture_halves_size() {
        let (policy, budget, l2, vq) = (policy(), budget(), l2(), venue_quality());
        let mut c = ctx(&policy, &budget, &l2, &vq);
        c.posture = Posture::Defensive;
        let decision = evaluate(&intent(), &snapshot(), &c, false).unwrap();
        assert_eq!(decision.approved_size, 500.0);
        assert!(decision.defensive_halved);
    }

    #[test]
    fn halted_posture_rejects() {
        let (policy, budget, l2, vq) = (policy(), budget(), l2(), venue_quality());
        let mut c = ctx(&policy, &budget, &l2, &vq);
        c.posture = Posture::Halted;
        let err = evaluate(&intent(), &snapshot(), &c, false).unwrap_err();
        assert_eq!(err, GateError::SystemHalted);
    }

    #[test]
    fn truth_degraded_rejects_unless_bypassed() {
        let (policy, budget, l2, vq) = (policy(), budget(), l2(), venue_quality());
        let mut c = ctx(&policy, &budget, &l2, &vq);
        c.truth_score = 10;
        let err = evaluate(&intent(), &snapshot(), &c, false).unwrap_err();
        assert!(matches!(err, GateError::TruthDegraded { .. }));

        let decision = evaluate(&intent(), &snapshot(), &c, true).unwrap();
        assert_eq!(decision.approved_size, 1_000.0);
    }

    #[test]
    fn thin_liquidity_rejects() {
        let (policy, budget, vq) = (policy(), budget(), venue_quality());
        let thin = L2Snapshot { best_bid: 50_000.0, best_ask: 50_005.0, bid_depth: 10.0, ask_depth: 10.0 };
        let err = evaluate(&intent(), &snapshot(), &ctx(&policy, &budget, &thin, &vq), false).unwrap_err();
        assert!(matches!(err, GateError::LiquidityInsufficient(_)));
    }

    #[test]
    fn degraded_venue_halves_size_by_default() {
        let (policy, budget, l2) = (policy(), budget(), l2());
        let bad_vq = VenueQualitySnapshot { slippage_bps: 100.0, ack_latency_ms: 50.0, max_slippage_bps: 20.0, max_ack_latency_ms: 500.0 };
        let decision = evaluate(&intent(), &snapshot(), &ctx(&policy, &budget, &l2, &bad_vq), false).unwrap();
        assert_eq!(decision.approved_size, 500.0);
    }

    #[test]
    fn short_stop_loss_too_close_rejects() {
        let (policy, budget, l2, vq) = (policy(), budget(), l2(), venue_quality());
        let mut i = intent();
        i.stop_loss = 49_990.0; // within 20bps of entry
        let err = evaluate(&i, &snapshot(), &ctx(&policy, &budget, &l2, &vq), false).unwrap_err();
        assert!(matches!(err, GateError::RiskCapExceeded(_)));
    }
}
