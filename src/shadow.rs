//! Module D — Shadow State.
//!
//! Authoritative in-memory model of intents, positions, and daily risk
//! counters, generalized from the teacher's `vault::paper_ledger::VaultPaperLedger`
//! (position map keyed by instrument, weighted-average-entry accumulation).
//! Mutations originate only from the Lifecycle Engine or Reconciliation
//! Engine; readers take a point-in-time clone via [`ShadowState::snapshot`].
//! Every mutation is durable: the caller is expected to have already
//! appended the corresponding event to the log (single writer, spec.md §5)
//! before calling the mutator here, so that log-replay after a crash can
//! reconstruct identical state.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::model::{Intent, IntentId, IntentRecord, IntentState, Position, PositionKey};

/// Per-day risk counters, reset by the caller at day boundaries.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DailyCounters {
    pub loss: f64,
    pub orders_this_minute: u32,
    pub drawdown_peak: f64,
}

/// A point-in-time, owned copy of the shadow tables for gate evaluation.
#[derive(Debug, Clone)]
pub struct ShadowSnapshot {
    pub intents: HashMap<IntentId, IntentRecord>,
    pub positions: HashMap<PositionKey, Position>,
    pub daily: DailyCounters,
}

impl ShadowSnapshot {
    /// Intents currently `Prepared` for `(producer, symbol, side)` — used by
    /// the at-most-one-prepared invariant (spec.md §8).
    pub fn has_prepared(&self, producer: &str, symbol: &str, side: crate::model::Side) -> bool {
        self.intents.values().any(|r| {
            r.state == IntentState::Prepared
                && r.intent.source == producer
                && r.intent.symbol == symbol
                && r.intent.side == side
        })
    }

    pub fn reserved_and_open_size(&self) -> f64 {
        self.intents
            .values()
            .filter(|r| matches!(r.state, IntentState::Prepared | IntentState::Confirmed | IntentState::Filled))
            .map(|r| r.reserved_size)
            .sum()
    }
}

/// On-disk checkpoint format, named `{stream}.chk.{sequence}` per spec.md §6.
#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    sequence: u64,
    intents: HashMap<IntentId, IntentRecord>,
    positions: HashMap<PositionKey, Position>,
    daily: DailyCounters,
}

pub struct ShadowState {
    intents: RwLock<HashMap<IntentId, IntentRecord>>,
    positions: RwLock<HashMap<PositionKey, Position>>,
    daily: RwLock<DailyCounters>,
    mutations_since_checkpoint: RwLock<u64>,
    last_sequence: RwLock<u64>,
}

impl ShadowState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            intents: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            daily: RwLock::new(DailyCounters::default()),
            mutations_since_checkpoint: RwLock::new(0),
            last_sequence: RwLock::new(0),
        })
    }

    pub fn snapshot(&self) -> ShadowSnapshot {
        ShadowSnapshot {
            intents: self.intents.read().clone(),
            positions: self.positions.read().clone(),
            daily: self.daily.read().clone(),
        }
    }

    fn note_mutation(&self, sequence: u64) {
        *self.mutations_since_checkpoint.write() += 1;
        *self.last_sequence.write() = sequence;
    }

    pub fn insert_prepared(&self, intent: Intent, reserved_size: f64, sequence: u64) {
        let record = IntentRecord {
            intent: intent.clone(),
            state: IntentState::Prepared,
            reserved_size,
            ack_pending: false,
            prepared_at_ms: Some(crate::now_millis()),
            plan: None,
        };
        self.intents.write().insert(intent.intent_id.clone(), record);
        self.note_mutation(sequence);
    }

    pub fn set_state(&self, intent_id: &str, state: IntentState, sequence: u64) {
        if let Some(record) = self.intents.write().get_mut(intent_id) {
            record.state = state;
        }
        self.note_mutation(sequence);
    }

    pub fn set_plan(&self, intent_id: &str, plan: crate::model::ExecutionPlan, sequence: u64) {
        if let Some(record) = self.intents.write().get_mut(intent_id) {
            record.plan = Some(plan);
        }
        self.note_mutation(sequence);
    }

    pub fn set_ack_pending(&self, intent_id: &str, pending: bool, sequence: u64) {
        if let Some(record) = self.intents.write().get_mut(intent_id) {
            record.ack_pending = pending;
        }
        self.note_mutation(sequence);
    }

    pub fn get_intent(&self, intent_id: &str) -> Option<IntentRecord> {
        self.intents.read().get(intent_id).cloned()
    }

    pub fn apply_fill(
        &self,
        key: PositionKey,
        fill_size: f64,
        fill_price: f64,
        intent_id: &IntentId,
        fill_sequence: u64,
        log_sequence: u64,
    ) {
        let mut positions = self.positions.write();
        let position = positions.entry(key).or_default();
        position.apply_fill(fill_size, fill_price, intent_id, fill_sequence);
        drop(positions);
        self.note_mutation(log_sequence);
    }

    pub fn get_position(&self, key: &PositionKey) -> Option<Position> {
        self.positions.read().get(key).cloned()
    }

    pub fn record_loss(&self, amount: f64, sequence: u64) {
        let mut daily = self.daily.write();
        daily.loss += amount;
        daily.drawdown_peak = daily.drawdown_peak.max(daily.loss);
        drop(daily);
        self.note_mutation(sequence);
    }

    pub fn increment_orders_this_minute(&self, producer_count: u32, sequence: u64) {
        self.daily.write().orders_this_minute += producer_count;
        self.note_mutation(sequence);
    }

    pub fn reset_minute_counter(&self) {
        self.daily.write().orders_this_minute = 0;
    }

    pub fn mutations_since_checkpoint(&self) -> u64 {
        *self.mutations_since_checkpoint.read()
    }

    /// Writes a checkpoint file named `{stream}.chk.{sequence}` under
    /// `log_dir`, per spec.md §6's persistence layout.
    pub fn checkpoint(&self, log_dir: &Path, stream: &str) -> Result<u64, anyhow::Error> {
        let sequence = *self.last_sequence.read();
        let checkpoint = Checkpoint {
            sequence,
            intents: self.intents.read().clone(),
            positions: self.positions.read().clone(),
            daily: self.daily.read().clone(),
        };
        std::fs::create_dir_all(log_dir)?;
        let path = log_dir.join(format!("{stream}.chk.{sequence}"));
        let bytes = serde_json::to_vec(&checkpoint)?;
        std::fs::write(path, bytes)?;
        *self.mutations_since_checkpoint.write() = 0;
        Ok(sequence)
    }

    /// Loads the latest checkpoint under `log_dir` for `stream`, if any,
    /// returning the sequence recovery should resume replay from.
    pub fn load_latest_checkpoint(&self, log_dir: &Path, stream: &str) -> Result<u64, anyhow::Error> {
        let prefix = format!("{stream}.chk.");
        let mut best: Option<(u64, std::path::PathBuf)> = None;
        if log_dir.exists() {
            for entry in std::fs::read_dir(log_dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(seq_str) = name.strip_prefix(&prefix) {
                    if let Ok(seq) = seq_str.parse::<u64>() {
                        if best.as_ref().map(|(s, _)| seq > *s).unwrap_or(true) {
                            best = Some((seq, entry.path()));
                        }
                    }
                }
            }
        }

        let Some((sequence, path)) = best else {
            return Ok(0);
        };

        let bytes = std::fs::read(path)?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
        *self.intents.write() = checkpoint.intents;
        *self.positions.write() = checkpoint.positions;
        *self.daily.write() = checkpoint.daily;
        *self.last_sequence.write() = sequence;
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Intent, Side};

    fn sample_intent(id: &str) -> Intent {
        Intent {
            intent_id: id.to_string(),
            source: "phase-a".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            entry_zone: (50_000.0, 50_100.0),
            stop_loss: 49_000.0,
            take_profits: vec![51_000.0],
            leverage: 2.0,
            requested_size: 1_000.0,
            confidence: 0.8,
            policy_hash: "abc".to_string(),
            correlation_id: "corr-1".to_string(),
            created_at: 0,
        }
    }

    #[test]
    fn checkpoint_and_recover_roundtrip() {
        let state = ShadowState::new();
        state.insert_prepared(sample_intent("I1"), 1_000.0, 1);
        state.set_state("I1", IntentState::Confirmed, 2);

        let dir = tempfile::tempdir().unwrap();
        let seq = state.checkpoint(dir.path(), "TITAN_EXECUTION").unwrap();
        assert_eq!(seq, 2);

        let fresh = ShadowState::new();
        let resumed_seq = fresh.load_latest_checkpoint(dir.path(), "TITAN_EXECUTION").unwrap();
        assert_eq!(resumed_seq, 2);
        let record = fresh.get_intent("I1").unwrap();
        assert_eq!(record.state, IntentState::Confirmed);
    }

    #[test]
    fn at_most_one_prepared_per_producer_symbol_side() {
        let state = ShadowState::new();
        state.insert_prepared(sample_intent("I1"), 1_000.0, 1);
        let snapshot = state.snapshot();
        assert!(snapshot.has_prepared("phase-a", "BTCUSDT", Side::Long));
        assert!(!snapshot.has_prepared("phase-a", "ETHUSDT", Side::Long));
    }

    #[test]
    fn position_weighted_average_updates_on_fill() {
        let state = ShadowState::new();
        let key = PositionKey::new("binance", "BTCUSDT");
        state.apply_fill(key.clone(), 0.02, 50_000.0, &"I1".to_string(), 1, 1);
        state.apply_fill(key.clone(), 0.02, 51_000.0, &"I1".to_string(), 2, 2);
        let position = state.get_position(&key).unwrap();
        assert!((position.net_size - 0.04).abs() < 1e-9);
        assert!((position.weighted_avg_entry - 50_500.0).abs() < 1e-6);
    }
}
