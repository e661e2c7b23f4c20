//! Core data model (spec.md §3): intents, positions, budgets, and the
//! event-log record shape shared by every component. Arena-and-indices style
//! per spec.md §9 — `IntentId`/`PositionKey` are opaque keys into tables owned
//! by [`crate::shadow::ShadowState`]; nothing here borrows across components.

use serde::{Deserialize, Serialize};

pub type IntentId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Long,
    Short,
}

/// `(venue, symbol)` composite key for the position table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PositionKey {
    pub venue: String,
    pub symbol: String,
}

impl PositionKey {
    pub fn new(venue: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self { venue: venue.into(), symbol: symbol.into() }
    }
}

/// A proposed or active position-opening directive, per spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    pub intent_id: IntentId,
    pub source: String,
    pub symbol: String,
    pub side: Side,
    pub entry_zone: (f64, f64),
    pub stop_loss: f64,
    pub take_profits: Vec<f64>,
    pub leverage: f64,
    pub requested_size: f64,
    pub confidence: f64,
    pub policy_hash: String,
    pub correlation_id: String,
    pub created_at: i64,
}

/// Finite intent-state set, per spec.md §3. `Display`/`as_str` are used for
/// structured logging fields and the status surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntentState {
    Pending,
    Prepared,
    Confirmed,
    Filled,
    PartiallyFilled,
    Rejected,
    Aborted,
    Expired,
}

impl IntentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IntentState::Filled | IntentState::Rejected | IntentState::Aborted | IntentState::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IntentState::Pending => "pending",
            IntentState::Prepared => "prepared",
            IntentState::Confirmed => "confirmed",
            IntentState::Filled => "filled",
            IntentState::PartiallyFilled => "partially_filled",
            IntentState::Rejected => "rejected",
            IntentState::Aborted => "aborted",
            IntentState::Expired => "expired",
        }
    }
}

/// An intent plus its current lifecycle state and bookkeeping fields needed
/// by the lifecycle engine (reserved size, ack_pending flag, ttl deadline).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentRecord {
    pub intent: Intent,
    pub state: IntentState,
    pub reserved_size: f64,
    pub ack_pending: bool,
    pub prepared_at_ms: Option<u64>,
    pub plan: Option<ExecutionPlan>,
}

/// Derived from the gate chain + L2 snapshot during PREPARE, per spec.md §4.F.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    pub venue: String,
    pub price: f64,
    pub size: f64,
    pub order_type: OrderType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

/// Position keyed by `(venue, symbol)`, per spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Position {
    pub net_size: f64,
    pub weighted_avg_entry: f64,
    pub unrealized_pnl: f64,
    pub entry_intents: Vec<IntentId>,
    pub last_fill_sequence: u64,
}

impl Position {
    /// Folds a fill into this position using cost-basis weighted averaging,
    /// the same accumulation style as the teacher's paper ledger.
    pub fn apply_fill(&mut self, fill_size: f64, fill_price: f64, intent_id: &IntentId, sequence: u64) {
        let new_size = self.net_size + fill_size;
        if new_size.abs() < f64::EPSILON {
            self.weighted_avg_entry = 0.0;
        } else if self.net_size.signum() == fill_size.signum() || self.net_size == 0.0 {
            let total_cost = self.weighted_avg_entry * self.net_size.abs() + fill_price * fill_size.abs();
            self.weighted_avg_entry = total_cost / new_size.abs();
        }
        self.net_size = new_size;
        self.entry_intents.push(intent_id.clone());
        self.last_fill_sequence = sequence;
    }
}

/// Budget state for a producer phase, per spec.md §3/§4.I.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BudgetState {
    Active,
    Throttled,
    Halted,
    CloseOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Budget {
    pub phase: String,
    pub allocated_equity: f64,
    pub state: BudgetState,
    pub regime: Regime,
    pub issued_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Stable,
    Volatile,
    Crash,
}

/// Global risk posture, per spec.md §4.K.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Posture {
    Normal,
    Defensive,
    Halted,
}

/// A durable event-log record, per spec.md §3/§4.C.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub stream: String,
    pub subject: String,
    pub sequence: u64,
    pub timestamp: i64,
    pub headers: std::collections::BTreeMap<String, String>,
    pub payload: serde_json::Value,
}

/// Normalized ledger posting produced by every fill, per spec.md §4.H.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerPosting {
    pub debit: f64,
    pub credit: f64,
    pub instrument: String,
    pub qty: f64,
    pub price: f64,
    pub fee: f64,
    pub intent_id: IntentId,
}
