//! Titan core entry point.
//!
//! Boots runtime config, loads and hashes the risk policy, recovers shadow
//! state from the latest checkpoint, opens the event log, wires the
//! dispatcher/gate chain/lifecycle engine, and serves the fast-path
//! transport socket alongside the read-only status HTTP surface. Grounded on
//! the teacher's `main.rs` startup sequence (config -> state -> routers ->
//! listeners) with the Polymarket-specific wiring stripped out.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use titan_core::allocator::Allocator;
use titan_core::breaker::{BreakerThresholds, PostureTracker};
use titan_core::codec::{Frame, Payload, ReplayGuard};
use titan_core::config::{RiskPolicy, RuntimeConfig};
use titan_core::dispatcher::{Dispatcher, PaperAdapter, VenueQualityTracker};
use titan_core::eventlog::EventLog;
use titan_core::lifecycle::LifecycleEngine;
use titan_core::model::Intent;
use titan_core::operator::{self, OperatorSurface, SignedCommand};
use titan_core::orchestrator::{self, AppState};
use titan_core::risk::{GateContext, L2Snapshot};
use titan_core::shadow::ShadowState;
use titan_core::transport::{FrameHandler, TransportServer};
use titan_core::truth::TruthEngine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(RuntimeConfig::from_env().context("loading runtime config")?);
    let (policy, policy_hash) = RiskPolicy::load(&config.policy_path).context("loading risk policy")?;
    tracing::info!(policy_hash, "risk policy loaded");

    let shadow = ShadowState::new();
    let event_log = Arc::new(EventLog::open(
        &config.log_dir.join("titan.db"),
        &titan_core::eventlog::default_stream_specs(),
    )?);
    let resumed_seq = shadow.load_latest_checkpoint(&config.log_dir, "TITAN_EXECUTION")?;
    tracing::info!(resumed_seq, "shadow state recovered from checkpoint");

    let quality = Arc::new(VenueQualityTracker::new(policy.max_spread_bps * 2.0, 500.0));
    let mut dispatcher = Dispatcher::new(quality.clone());
    dispatcher.register(Arc::new(PaperAdapter::new("binance")), 20.0, 20.0);
    let dispatcher = Arc::new(dispatcher);

    let lifecycle = Arc::new(LifecycleEngine::new(
        shadow.clone(),
        event_log.clone(),
        dispatcher.clone(),
        config.prepare_ttl,
        config.venue_max_retries,
    ));

    let truth = Arc::new(TruthEngine::new(config.drift_pct_threshold));
    let allocator = Arc::new(Allocator::new());
    let posture = Arc::new(RwLock::new(PostureTracker::new(
        BreakerThresholds {
            defensive_truth: config.defensive_truth,
            halt_truth: config.halt_truth,
            ..BreakerThresholds::default()
        },
        config.hysteresis_window,
    )));
    let operator_surface = Arc::new(OperatorSurface::new(
        config.hmac_secret.clone(),
        std::time::Duration::from_millis(config.clock_skew_ms),
    ));
    let armed = Arc::new(AtomicBool::new(false));
    let operator_halt = Arc::new(AtomicBool::new(false));

    let state = AppState {
        config: config.clone(),
        policy: Arc::new(RwLock::new(policy)),
        shadow: shadow.clone(),
        event_log: event_log.clone(),
        dispatcher: dispatcher.clone(),
        lifecycle: lifecycle.clone(),
        truth: truth.clone(),
        allocator: allocator.clone(),
        posture: posture.clone(),
        operator: operator_surface.clone(),
        armed: armed.clone(),
        operator_halt: operator_halt.clone(),
    };

    tokio::spawn(orchestrator::run_background_ticks(
        state.clone(),
        vec!["phase-a".to_string()],
        titan_core::model::Regime::Stable,
    ));

    let http_state = state.clone();
    let http = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind("0.0.0.0:7878")
            .await
            .expect("bind status http listener");
        tracing::info!("status surface listening on :7878");
        axum::serve(
            listener,
            titan_core::api::router(http_state).into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .expect("status http server");
    });

    let handler = make_handler(state, policy_hash);
    let server = TransportServer::new(config.socket_path.clone(), handler);
    tracing::info!(path = %config.socket_path.display(), "titan core ready");
    server.serve().await?;

    http.abort();
    Ok(())
}

/// Builds the fast-path frame handler closing over shared state. PREPARE and
/// ABORT are purely synchronous (no gate ever awaits); CONFIRM and FLATTEN
/// dispatch to the venue and so run through the same boxed-future shape.
fn make_handler(state: AppState, policy_hash: String) -> FrameHandler {
    let replay_guard = Arc::new(parking_lot::Mutex::new(ReplayGuard::new(state.config.replay_window)));
    Arc::new(move |frame: Frame| -> Pin<Box<dyn Future<Output = Frame> + Send>> {
        let state = state.clone();
        let policy_hash = policy_hash.clone();
        let replay_guard = replay_guard.clone();
        Box::pin(async move {
            if let Err(err) = frame.verify(&state.config.hmac_secret, std::time::Duration::from_millis(state.config.clock_skew_ms)) {
                return error_reply(&frame, &format!("{err}"));
            }
            if replay_guard.lock().check_and_record(&frame.correlation_id).is_err() {
                return error_reply(&frame, "replay detected");
            }

            match &frame.payload {
                Payload::Ping => reply(&frame, Payload::Pong),
                Payload::IntentPrepare { intent } => handle_prepare(&state, &frame, intent, &policy_hash),
                Payload::IntentConfirm { intent_id } => handle_confirm(&state, &frame, intent_id).await,
                Payload::IntentAbort { intent_id } => handle_abort(&state, &frame, intent_id),
                Payload::OperatorCmd { command } => handle_operator(&state, &frame, command),
                other => error_reply(&frame, &format!("unexpected payload at core: {other:?}")),
            }
        })
    })
}

fn reply(frame: &Frame, payload: Payload) -> Frame {
    Frame {
        correlation_id: frame.correlation_id.clone(),
        timestamp: frame.timestamp,
        headers: frame.headers.clone(),
        payload,
    }
}

fn error_reply(frame: &Frame, message: &str) -> Frame {
    reply(frame, Payload::Error { message: message.to_string() })
}

fn handle_prepare(state: &AppState, frame: &Frame, intent_value: &serde_json::Value, policy_hash: &str) -> Frame {
    let intent: Intent = match serde_json::from_value(intent_value.clone()) {
        Ok(i) => i,
        Err(err) => return error_reply(frame, &format!("malformed intent: {err}")),
    };

    let policy = state.policy.read();
    let venue_quality = state.dispatcher.quality.snapshot_for_gate("binance");
    let budget = state.allocator.budget(&intent.source);
    let l2 = L2Snapshot { best_bid: intent.entry_zone.0, best_ask: intent.entry_zone.1, bid_depth: 1e9, ask_depth: 1e9 };
    let ctx = GateContext {
        policy: &policy,
        active_policy_hash: policy_hash,
        armed: state.is_armed(),
        posture: state.current_posture(),
        truth_score: state.truth.last_score(),
        min_truth_for_new_risk: state.config.min_truth_for_new_risk,
        budget: budget.as_ref(),
        orders_this_minute_for_producer: 0,
        l2: &l2,
        venue: "binance",
        venue_quality: &venue_quality,
        venue_degraded_rejects: false,
    };

    match state.lifecycle.prepare(intent, &ctx) {
        Ok(outcome) => reply(frame, Payload::Prepared { intent_id: outcome.intent_id, position_size: outcome.position_size }),
        Err(err) => error_reply(frame, &format!("{err}")),
    }
}

async fn handle_confirm(state: &AppState, frame: &Frame, intent_id: &str) -> Frame {
    match state.lifecycle.confirm(intent_id).await {
        Ok(()) => reply(frame, Payload::Executed { intent_id: intent_id.to_string() }),
        Err(err) => error_reply(frame, &format!("{err}")),
    }
}

fn handle_abort(state: &AppState, frame: &Frame, intent_id: &str) -> Frame {
    match state.lifecycle.abort(intent_id) {
        Ok(()) => reply(frame, Payload::Aborted { intent_id: intent_id.to_string() }),
        Err(err) => error_reply(frame, &format!("{err}")),
    }
}

fn handle_operator(state: &AppState, frame: &Frame, command_value: &serde_json::Value) -> Frame {
    let signed: SignedCommand = match serde_json::from_value(command_value.clone()) {
        Ok(c) => c,
        Err(err) => return error_reply(frame, &format!("malformed operator command: {err}")),
    };
    if let Err(err) = state.operator.verify(&signed) {
        audit_operator_command(state, &signed, "rejected", &format!("{err:?}"));
        return error_reply(frame, &format!("{err:?}"));
    }
    audit_operator_command(state, &signed, "accepted", "");

    match signed.command {
        operator::OperatorCommand::Arm => {
            // Arming is independent of posture: a NORMAL posture just arms.
            // Only DEFENSIVE/HALTED require `try_reset`'s hysteresis check
            // before arming is allowed (spec.md §4.K).
            if state.current_posture() != titan_core::model::Posture::Normal {
                if let Err(reason) = state.posture.write().try_reset() {
                    return error_reply(frame, reason);
                }
            }
            state.operator_halt.store(false, std::sync::atomic::Ordering::Relaxed);
            state.armed.store(true, std::sync::atomic::Ordering::Relaxed);
        }
        operator::OperatorCommand::Disarm => state.armed.store(false, std::sync::atomic::Ordering::Relaxed),
        operator::OperatorCommand::Halt => {
            state.armed.store(false, std::sync::atomic::Ordering::Relaxed);
            state.operator_halt.store(true, std::sync::atomic::Ordering::Relaxed);
        }
        operator::OperatorCommand::Flatten => {
            let policy = state.policy.read();
            let venue_quality = state.dispatcher.quality.snapshot_for_gate("binance");
            let l2 = L2Snapshot { best_bid: 1.0, best_ask: 1.0, bid_depth: 1e9, ask_depth: 1e9 };
            let ctx = GateContext {
                policy: &policy,
                active_policy_hash: "",
                armed: true,
                posture: state.current_posture(),
                truth_score: state.truth.last_score(),
                min_truth_for_new_risk: 0,
                budget: None,
                orders_this_minute_for_producer: 0,
                l2: &l2,
                venue: "binance",
                venue_quality: &venue_quality,
                venue_degraded_rejects: false,
            };
            state.lifecycle.flatten_all("operator", "", &ctx);
        }
        operator::OperatorCommand::SetPosture { .. } | operator::OperatorCommand::ApplyPreset { .. } => {
            // Posture/preset overrides beyond ARM/DISARM/HALT/FLATTEN are
            // recorded in the audit trail only; the tracker remains the
            // sole posture authority per spec.md §4.K.
        }
    }

    reply(frame, Payload::Pong)
}

/// Appends every operator command decision to the event log under
/// `titan.evt.operator.audit.v1` (SPEC_FULL.md §0.5). Never serializes the
/// HMAC signature itself, only the command and its verdict.
fn audit_operator_command(state: &AppState, signed: &SignedCommand, verdict: &str, verdict_detail: &str) {
    let payload = serde_json::json!({
        "command": signed.command,
        "initiator_id": signed.initiator_id,
        "reason": signed.reason,
        "nonce": signed.nonce,
        "timestamp": signed.timestamp,
        "verdict": verdict,
        "verdict_detail": verdict_detail,
    });
    if let Err(err) = state.event_log.append("TITAN_EXECUTION", "titan.evt.operator.audit.v1", std::collections::BTreeMap::new(), payload) {
        tracing::warn!(error = %err, "failed to append operator audit record");
    }
}
