//! Module F — Intent Lifecycle Engine.
//!
//! Owns the PREPARE/CONFIRM/ABORT two-phase commit state machine
//! (spec.md §4.F), generalized from the teacher's
//! `vault::trade_executor::TradeExecutor` per-signal processing shape
//! (`process_signal` -> `execute_for_user` -> result) into the formal
//! intent state machine. Every transition here writes its event to the log
//! before mutating Shadow State, preserving the single-writer /
//! message-passing discipline of spec.md §5.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::error::{IntentError, ShapeError};
use crate::eventlog::EventLog;
use crate::model::{ExecutionPlan, Intent, IntentState, OrderType, PositionKey, Side};
use crate::risk::{evaluate, evaluate_flatten, GateContext};
use crate::shadow::ShadowState;

pub struct PrepareOutcome {
    pub intent_id: String,
    pub position_size: f64,
}

pub struct LifecycleEngine {
    shadow: Arc<ShadowState>,
    event_log: Arc<EventLog>,
    dispatcher: Arc<Dispatcher>,
    prepare_ttl: std::time::Duration,
    venue_max_retries: u32,
}

impl LifecycleEngine {
    pub fn new(
        shadow: Arc<ShadowState>,
        event_log: Arc<EventLog>,
        dispatcher: Arc<Dispatcher>,
        prepare_ttl: std::time::Duration,
        venue_max_retries: u32,
    ) -> Self {
        Self { shadow, event_log, dispatcher, prepare_ttl, venue_max_retries }
    }

    /// Runs the gate chain (synchronously, per spec.md §5) and, on success,
    /// reserves budget and records the intent as `Prepared`. Schedules an
    /// auto-release TTL expiry task.
    pub fn prepare(self: &Arc<Self>, intent: Intent, ctx: &GateContext) -> Result<PrepareOutcome, IntentError> {
        if self.shadow.get_intent(&intent.intent_id).is_some() {
            return Err(ShapeError::Duplicate(intent.intent_id.clone()).into());
        }

        let snapshot = self.shadow.snapshot();
        if snapshot.has_prepared(&intent.source, &intent.symbol, intent.side) {
            return Err(IntentError::AlreadyPrepared(intent.symbol.clone()));
        }

        let decision = evaluate(&intent, &snapshot, ctx, false)?;

        let mut headers = BTreeMap::new();
        headers.insert("source".to_string(), intent.source.clone());
        let subject = format!("titan.cmd.execution.place.v1.{}.{}", ctx.venue, intent.symbol);
        let sequence = self
            .event_log
            .append(
                "TITAN_EXECUTION",
                &subject,
                headers,
                serde_json::json!({
                    "intent_id": intent.intent_id,
                    "policy_hash": intent.policy_hash,
                    "approved_size": decision.approved_size,
                }),
            )
            .map_err(|_| ShapeError::InvalidFrame("event log append failed".to_string()))?;

        self.shadow.insert_prepared(intent.clone(), decision.approved_size, sequence);

        let price = (intent.entry_zone.0 + intent.entry_zone.1) / 2.0;
        let plan = ExecutionPlan {
            venue: ctx.venue.to_string(),
            price,
            size: decision.approved_size,
            order_type: OrderType::Market,
        };
        self.shadow.set_plan(&intent.intent_id, plan, sequence);

        self.spawn_ttl_expiry(intent.intent_id.clone());

        Ok(PrepareOutcome { intent_id: intent.intent_id, position_size: decision.approved_size })
    }

    fn spawn_ttl_expiry(self: &Arc<Self>, intent_id: String) {
        let this = self.clone();
        let ttl = self.prepare_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            this.expire_if_still_prepared(&intent_id);
        });
    }

    fn expire_if_still_prepared(&self, intent_id: &str) {
        if let Some(record) = self.shadow.get_intent(intent_id) {
            if record.state == IntentState::Prepared {
                let sequence = self
                    .event_log
                    .append(
                        "TITAN_EXECUTION",
                        "titan.evt.execution.reject.v1",
                        BTreeMap::new(),
                        serde_json::json!({ "intent_id": intent_id, "reason": "expired" }),
                    )
                    .unwrap_or(0);
                self.shadow.set_state(intent_id, IntentState::Expired, sequence);
                tracing::info!(intent_id, "intent expired after prepare_ttl");
            }
        }
    }

    /// Executes a previously prepared intent's plan via the venue
    /// dispatcher. Classifies venue failures per spec.md §4.F/§7:
    /// retryable errors are retried with bounded jitter up to
    /// `venue_max_retries`; terminal errors surface as `Rejected`;
    /// ambiguous errors leave the intent `Confirmed` with `ack_pending` set
    /// for the reconciliation engine to resolve.
    pub async fn confirm(&self, intent_id: &str) -> Result<(), IntentError> {
        let record = self.shadow.get_intent(intent_id).ok_or_else(|| IntentError::NotPrepared(intent_id.to_string()))?;
        if record.state != IntentState::Prepared {
            return Err(IntentError::NotPrepared(intent_id.to_string()));
        }
        let plan = record.plan.clone().ok_or_else(|| IntentError::NotPrepared(intent_id.to_string()))?;

        let confirm_seq = self
            .event_log
            .append(
                "TITAN_EXECUTION",
                "titan.evt.execution.order_placed.v1",
                BTreeMap::new(),
                serde_json::json!({ "intent_id": intent_id, "venue": plan.venue }),
            )
            .unwrap_or(0);
        self.shadow.set_state(intent_id, IntentState::Confirmed, confirm_seq);

        let mut attempt = 0u32;
        loop {
            match self.dispatcher.dispatch(&intent_id.to_string(), &plan).await {
                Ok(ack) => {
                    let fill_seq = self
                        .event_log
                        .append(
                            "TITAN_EXECUTION",
                            "titan.evt.execution.fill.v1",
                            BTreeMap::new(),
                            serde_json::json!({
                                "intent_id": intent_id,
                                "venue_order_id": ack.venue_order_id,
                                "fill_price": ack.fill_price,
                                "fill_size": ack.fill_size,
                            }),
                        )
                        .unwrap_or(0);

                    let key = PositionKey::new(plan.venue.clone(), record.intent.symbol.clone());
                    let signed_size = match record.intent.side {
                        Side::Long => ack.fill_size,
                        Side::Short => -ack.fill_size,
                    };
                    self.shadow.apply_fill(key, signed_size, ack.fill_price, &intent_id.to_string(), fill_seq, fill_seq);
                    self.shadow.set_state(intent_id, IntentState::Filled, fill_seq);
                    return Ok(());
                }
                Err(crate::error::VenueError::Retryable(reason)) => {
                    attempt += 1;
                    if attempt > self.venue_max_retries {
                        let seq = self.append_reject(intent_id, &reason);
                        self.shadow.set_state(intent_id, IntentState::Rejected, seq);
                        return Err(IntentError::VenueRetriesExhausted(intent_id.to_string()));
                    }
                    let jitter_ms = (attempt as u64 * 37) % 100;
                    tokio::time::sleep(std::time::Duration::from_millis(50 * attempt as u64 + jitter_ms)).await;
                }
                Err(crate::error::VenueError::Terminal(reason)) => {
                    let seq = self.append_reject(intent_id, &reason);
                    self.shadow.set_state(intent_id, IntentState::Rejected, seq);
                    return Err(IntentError::VenueRejected(intent_id.to_string(), reason));
                }
                Err(crate::error::VenueError::Ambiguous(reason)) => {
                    let seq = self.append_reject(intent_id, &reason);
                    self.shadow.set_ack_pending(intent_id, true, seq);
                    tracing::warn!(intent_id, reason, "venue response ambiguous, awaiting reconciliation");
                    return Ok(());
                }
            }
        }
    }

    fn append_reject(&self, intent_id: &str, reason: &str) -> u64 {
        self.event_log
            .append(
                "TITAN_EXECUTION",
                "titan.evt.execution.reject.v1",
                BTreeMap::new(),
                serde_json::json!({ "intent_id": intent_id, "reason": reason }),
            )
            .unwrap_or(0)
    }

    /// Discards a prepared plan and releases its reservation.
    pub fn abort(&self, intent_id: &str) -> Result<(), IntentError> {
        let record = self.shadow.get_intent(intent_id).ok_or_else(|| IntentError::NotPrepared(intent_id.to_string()))?;
        if record.state != IntentState::Prepared {
            return Err(IntentError::NotPrepared(intent_id.to_string()));
        }
        let sequence = self
            .event_log
            .append(
                "TITAN_EXECUTION",
                "titan.evt.execution.reject.v1",
                BTreeMap::new(),
                serde_json::json!({ "intent_id": intent_id, "reason": "aborted" }),
            )
            .unwrap_or(0);
        self.shadow.set_state(intent_id, IntentState::Aborted, sequence);
        Ok(())
    }

    /// Constructs and prepares synthetic close intents for every open
    /// position, bypassing the budget and Truth gates (spec.md §4.J,
    /// Open Question 1) but not risk math.
    pub fn flatten_all(self: &Arc<Self>, source: &str, policy_hash: &str, ctx_template: &GateContext) -> Vec<PrepareOutcome> {
        let snapshot = self.shadow.snapshot();
        let mut outcomes = Vec::new();
        for (key, position) in snapshot.positions.iter() {
            if position.net_size.abs() < f64::EPSILON {
                continue;
            }
            let side = if position.net_size > 0.0 { Side::Short } else { Side::Long };
            let close_intent = Intent {
                intent_id: format!("flatten-{}-{}", key.symbol, chrono::Utc::now().timestamp_millis()),
                source: source.to_string(),
                symbol: key.symbol.clone(),
                side,
                entry_zone: (position.weighted_avg_entry, position.weighted_avg_entry),
                stop_loss: position.weighted_avg_entry,
                take_profits: vec![],
                leverage: 1.0,
                requested_size: position.net_size.abs(),
                confidence: 1.0,
                policy_hash: policy_hash.to_string(),
                correlation_id: "flatten".to_string(),
                created_at: chrono::Utc::now().timestamp_millis(),
            };

            let mut ctx = GateContext {
                venue: &key.venue,
                ..*ctx_template
            };
            ctx.budget = None;
            if let Ok(decision) = evaluate_flatten(&close_intent, &snapshot, &ctx) {
                let sequence = self
                    .event_log
                    .append(
                        "TITAN_EXECUTION",
                        &format!("titan.cmd.execution.place.v1.{}.{}", key.venue, key.symbol),
                        BTreeMap::new(),
                        serde_json::json!({ "intent_id": close_intent.intent_id, "flatten": true }),
                    )
                    .unwrap_or(0);
                let intent_id = close_intent.intent_id.clone();
                self.shadow.insert_prepared(close_intent, decision.approved_size, sequence);
                outcomes.push(PrepareOutcome { intent_id, position_size: decision.approved_size });
            }
        }
        outcomes
    }
}
