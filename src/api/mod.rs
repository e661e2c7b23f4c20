//! Read-only status/introspection HTTP surface (SPEC_FULL.md §0.5). No
//! write paths live here — command submission goes through the signed
//! operator surface over the fast-path transport, not HTTP.

pub mod rate_limit;
pub mod routes;

use axum::{middleware, routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::orchestrator::AppState;
use rate_limit::{RateLimitConfig, RateLimiter};

pub fn router(state: AppState) -> Router {
    let limiter = RateLimiter::new(RateLimitConfig::default());
    Router::new()
        .route("/health", get(routes::health))
        .route("/status/posture", get(routes::posture))
        .route("/status/budgets", get(routes::budgets))
        .route("/status/truth", get(routes::truth))
        .route("/status/venues", get(routes::venues))
        .layer(middleware::from_fn_with_state(limiter, rate_limit::enforce))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
