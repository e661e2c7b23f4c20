//! Module I — Budget Allocator (Orchestrator).
//!
//! Runs on a periodic tick (`allocator_period`, default 5s) and issues
//! per-phase budgets under `titan.cmd.budget.v1.{phase}` (spec.md §4.I).
//! Grounded on the teacher's `risk::RiskManager::regime_risk` multiplier and
//! `models::Config`'s periodic-tick configuration style.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use crate::model::{Budget, BudgetState, Regime};

/// Read-only per-phase input the allocator consumes each tick.
#[derive(Debug, Clone)]
pub struct PhaseInput {
    pub phase: String,
    pub sharpe_30d: f64,
    pub base_equity: f64,
}

pub struct Allocator {
    budgets: RwLock<HashMap<String, Budget>>,
}

impl Allocator {
    pub fn new() -> Self {
        Self { budgets: RwLock::new(HashMap::new()) }
    }

    pub fn budget(&self, phase: &str) -> Option<Budget> {
        self.budgets.read().get(phase).cloned()
    }

    pub fn all_budgets(&self) -> Vec<Budget> {
        self.budgets.read().values().cloned().collect()
    }

    /// One allocator tick. Implements the three regime rules of spec.md
    /// §4.I exactly: Crash closes every phase; Volatile halves allocation;
    /// Stable scales proportionally to each phase's 30-day Sharpe.
    pub fn tick(&self, regime: Regime, phases: &[PhaseInput]) -> Vec<Budget> {
        let issued_at = Utc::now().timestamp_millis();
        let mut budgets = self.budgets.write();
        let mut out = Vec::with_capacity(phases.len());

        match regime {
            Regime::Crash => {
                for phase in phases {
                    let budget = Budget {
                        phase: phase.phase.clone(),
                        allocated_equity: 0.0,
                        state: BudgetState::CloseOnly,
                        regime,
                        issued_at,
                    };
                    budgets.insert(phase.phase.clone(), budget.clone());
                    out.push(budget);
                }
            }
            Regime::Volatile => {
                for phase in phases {
                    let budget = Budget {
                        phase: phase.phase.clone(),
                        allocated_equity: phase.base_equity * 0.5,
                        state: BudgetState::Throttled,
                        regime,
                        issued_at,
                    };
                    budgets.insert(phase.phase.clone(), budget.clone());
                    out.push(budget);
                }
            }
            Regime::Stable => {
                let total_sharpe: f64 = phases.iter().map(|p| p.sharpe_30d.max(0.0)).sum();
                for phase in phases {
                    let weight = if total_sharpe > 0.0 {
                        phase.sharpe_30d.max(0.0) / total_sharpe
                    } else {
                        1.0 / phases.len().max(1) as f64
                    };
                    let budget = Budget {
                        phase: phase.phase.clone(),
                        allocated_equity: phase.base_equity * weight * phases.len() as f64,
                        state: BudgetState::Active,
                        regime,
                        issued_at,
                    };
                    budgets.insert(phase.phase.clone(), budget.clone());
                    out.push(budget);
                }
            }
        }

        out
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phases() -> Vec<PhaseInput> {
        vec![
            PhaseInput { phase: "phase-a".to_string(), sharpe_30d: 2.0, base_equity: 10_000.0 },
            PhaseInput { phase: "phase-b".to_string(), sharpe_30d: 1.0, base_equity: 10_000.0 },
        ]
    }

    #[test]
    fn crash_regime_closes_all_phases() {
        let allocator = Allocator::new();
        let out = allocator.tick(Regime::Crash, &phases());
        assert!(out.iter().all(|b| b.state == BudgetState::CloseOnly));
        assert!(out.iter().all(|b| b.allocated_equity == 0.0));
    }

    #[test]
    fn volatile_regime_halves_allocation() {
        let allocator = Allocator::new();
        let out = allocator.tick(Regime::Volatile, &phases());
        assert!(out.iter().all(|b| b.state == BudgetState::Throttled));
        assert_eq!(out[0].allocated_equity, 5_000.0);
    }

    #[test]
    fn stable_regime_weights_by_sharpe() {
        let allocator = Allocator::new();
        let out = allocator.tick(Regime::Stable, &phases());
        let a = out.iter().find(|b| b.phase == "phase-a").unwrap();
        let b = out.iter().find(|b| b.phase == "phase-b").unwrap();
        assert!(a.allocated_equity > b.allocated_equity);
    }
}
