//! Handlers for the read-only status surface. Every response is a point-in-
//! time snapshot; none of these endpoints mutate state (spec.md §1 keeps
//! the operator write path on the signed command surface, not HTTP).

use axum::{extract::State as AxumState, http::StatusCode, response::Json};
use serde::Serialize;

use crate::dispatcher::VenueQualityReport;
use crate::model::{Budget, Posture};
use crate::orchestrator::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub armed: bool,
    pub posture: Posture,
}

pub async fn health(AxumState(state): AxumState<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", armed: state.is_armed(), posture: state.current_posture() })
}

#[derive(Debug, Serialize)]
pub struct PostureResponse {
    pub posture: Posture,
    pub armed: bool,
}

pub async fn posture(AxumState(state): AxumState<AppState>) -> Json<PostureResponse> {
    Json(PostureResponse { posture: state.current_posture(), armed: state.is_armed() })
}

pub async fn budgets(AxumState(state): AxumState<AppState>) -> Result<Json<Vec<Budget>>, StatusCode> {
    Ok(Json(state.allocator.all_budgets()))
}

#[derive(Debug, Serialize)]
pub struct TruthResponse {
    pub score: u8,
    pub ledger_entries: usize,
}

pub async fn truth(AxumState(state): AxumState<AppState>) -> Json<TruthResponse> {
    Json(TruthResponse { score: state.truth.last_score(), ledger_entries: state.truth.ledger_len() })
}

pub async fn venues(AxumState(state): AxumState<AppState>) -> Json<Vec<VenueQualityReport>> {
    Json(state.dispatcher.quality.all_reports())
}
