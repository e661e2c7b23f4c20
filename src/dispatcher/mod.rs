//! Module G — Venue Dispatcher.
//!
//! Generalizes the teacher's `vault::execution::ExecutionAdapter` trait
//! (`async fn place_order`) into the capability-set adapter registry of
//! spec.md §9: the dispatcher holds adapters keyed by venue name, enforces a
//! per-venue token-bucket rate limit, and guarantees idempotent submission
//! by `intent_id` (spec.md §4.G) regardless of whether the adapter itself
//! remembers the duplicate.

pub mod quality;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::VenueError;
use crate::model::{ExecutionPlan, IntentId};

pub use quality::{VenueQualityReport, VenueQualityTracker};

/// Ack returned by a venue on successful (or already-seen) submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderAck {
    pub intent_id: IntentId,
    pub venue: String,
    pub venue_order_id: String,
    pub fill_price: f64,
    pub fill_size: f64,
}

/// Capability-set adapter contract (spec.md §9, §4.G). Implementors must
/// treat duplicate `intent_id` submissions as no-ops and return the prior
/// ack, matching spec.md §4.G's idempotency requirement and the teacher's
/// `ExecutionAdapter::place_order` shape.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    fn venue_name(&self) -> &str;
    async fn place_order(&self, intent_id: &IntentId, plan: &ExecutionPlan) -> Result<OrderAck, VenueError>;
}

/// Simple token-bucket rate limiter, one per venue.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: std::time::Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self { capacity, tokens: capacity, refill_per_sec, last_refill: std::time::Instant::now() }
    }

    fn try_take(&mut self) -> bool {
        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// A venue adapter paired with its paper/live execution mode, keyed by
/// venue. Selects a primary venue from the plan and enforces rate limits
/// and idempotency before calling into the adapter.
pub struct Dispatcher {
    adapters: HashMap<String, Arc<dyn ExecutionAdapter>>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    idempotency: Mutex<HashMap<IntentId, OrderAck>>,
    pub quality: Arc<VenueQualityTracker>,
}

impl Dispatcher {
    pub fn new(quality: Arc<VenueQualityTracker>) -> Self {
        Self {
            adapters: HashMap::new(),
            buckets: Mutex::new(HashMap::new()),
            idempotency: Mutex::new(HashMap::new()),
            quality,
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ExecutionAdapter>, bucket_capacity: f64, refill_per_sec: f64) {
        let venue = adapter.venue_name().to_string();
        self.buckets.lock().insert(venue.clone(), TokenBucket::new(bucket_capacity, refill_per_sec));
        self.adapters.insert(venue, adapter);
    }

    /// Dispatches a confirmed plan. Returns the prior ack without calling
    /// the adapter again if `intent_id` was already submitted.
    pub async fn dispatch(&self, intent_id: &IntentId, plan: &ExecutionPlan) -> Result<OrderAck, VenueError> {
        if let Some(prior) = self.idempotency.lock().get(intent_id).cloned() {
            return Ok(prior);
        }

        let adapter = self
            .adapters
            .get(&plan.venue)
            .ok_or_else(|| VenueError::Terminal(format!("no adapter registered for venue {}", plan.venue)))?;

        {
            let mut buckets = self.buckets.lock();
            let bucket = buckets
                .get_mut(&plan.venue)
                .ok_or_else(|| VenueError::Terminal(format!("no rate limiter for venue {}", plan.venue)))?;
            if !bucket.try_take() {
                return Err(VenueError::Retryable(format!("rate limit exhausted for venue {}", plan.venue)));
            }
        }

        let started = std::time::Instant::now();
        let ack = adapter.place_order(intent_id, plan).await;
        self.quality.record_ack(&plan.venue, started.elapsed());

        match ack {
            Ok(ack) => {
                self.idempotency.lock().insert(intent_id.clone(), ack.clone());
                let slippage_bps = (ack.fill_price - plan.price).abs() / plan.price * 10_000.0;
                self.quality.record_fill(&plan.venue, started.elapsed(), slippage_bps);
                Ok(ack)
            }
            Err(VenueError::Terminal(reason)) => {
                self.quality.record_reject(&plan.venue);
                Err(VenueError::Terminal(reason))
            }
            Err(other) => Err(other),
        }
    }
}

/// A paper adapter for local testing and dry-run operation, grounded on the
/// teacher's `PaperExecutionAdapter` (simulated latency-free fill at the
/// plan's price, always accepting).
pub struct PaperAdapter {
    venue: String,
}

impl PaperAdapter {
    pub fn new(venue: impl Into<String>) -> Self {
        Self { venue: venue.into() }
    }
}

#[async_trait]
impl ExecutionAdapter for PaperAdapter {
    fn venue_name(&self) -> &str {
        &self.venue
    }

    async fn place_order(&self, intent_id: &IntentId, plan: &ExecutionPlan) -> Result<OrderAck, VenueError> {
        Ok(OrderAck {
            intent_id: intent_id.clone(),
            venue: self.venue.clone(),
            venue_order_id: format!("paper-{intent_id}"),
            fill_price: plan.price,
            fill_size: plan.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderType;

    fn plan() -> ExecutionPlan {
        ExecutionPlan { venue: "binance".to_string(), price: 50_000.0, size: 1_000.0, order_type: OrderType::Market }
    }

    #[tokio::test]
    async fn dispatch_is_idempotent_by_intent_id() {
        let mut dispatcher = Dispatcher::new(Arc::new(VenueQualityTracker::new(20.0, 500.0)));
        dispatcher.register(Arc::new(PaperAdapter::new("binance")), 10.0, 10.0);

        let id = "I1".to_string();
        let ack1 = dispatcher.dispatch(&id, &plan()).await.unwrap();
        let ack2 = dispatcher.dispatch(&id, &plan()).await.unwrap();
        assert_eq!(ack1, ack2);
    }

    #[tokio::test]
    async fn unregistered_venue_is_terminal() {
        let dispatcher = Dispatcher::new(Arc::new(VenueQualityTracker::new(20.0, 500.0)));
        let err = dispatcher.dispatch(&"I1".to_string(), &plan()).await.unwrap_err();
        assert!(matches!(err, VenueError::Terminal(_)));
    }

    #[tokio::test]
    async fn rate_limit_exhaustion_is_retryable() {
        let mut dispatcher = Dispatcher::new(Arc::new(VenueQualityTracker::new(20.0, 500.0)));
        dispatcher.register(Arc::new(PaperAdapter::new("binance")), 1.0, 0.0);

        dispatcher.dispatch(&"I1".to_string(), &plan()).await.unwrap();
        let err = dispatcher.dispatch(&"I2".to_string(), &plan()).await.unwrap_err();
        assert!(matches!(err, VenueError::Retryable(_)));
    }
}
