//! Request-budget limiting for the status surface (SPEC_FULL.md §0.5),
//! generalizing spec.md §4.E.8's orders-per-minute concept from the order
//! path to the read-only HTTP path. Sliding per-IP window with a small
//! burst allowance. Grounded on the teacher's `middleware::rate_limit`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State as AxumState},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;

#[derive(Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_requests: 120, window: Duration::from_secs(60), burst: 20 }
    }
}

struct Entry {
    count: u32,
    window_start: Instant,
}

#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Arc<Mutex<HashMap<IpAddr, Entry>>>,
}

enum Verdict {
    Allowed,
    Exceeded { retry_after: Duration },
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, state: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn check(&self, ip: IpAddr) -> Verdict {
        let mut state = self.state.lock();
        let now = Instant::now();
        let entry = state.entry(ip).or_insert(Entry { count: 0, window_start: now });

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;

        let limit = self.config.max_requests + self.config.burst;
        if entry.count > limit {
            Verdict::Exceeded { retry_after: (entry.window_start + self.config.window).saturating_duration_since(now) }
        } else {
            Verdict::Allowed
        }
    }
}

pub async fn enforce(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AxumState(limiter): AxumState<RateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match limiter.check(addr.ip()) {
        Verdict::Allowed => next.run(request).await,
        Verdict::Exceeded { retry_after } => {
            tracing::warn!(ip = %addr.ip(), retry_after_secs = retry_after.as_secs(), "status surface rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.as_secs().to_string())],
                axum::Json(serde_json::json!({
                    "error": "rate_limit_exceeded",
                    "retry_after_seconds": retry_after.as_secs(),
                })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_under_limit_then_rejects_past_burst() {
        let limiter = RateLimiter::new(RateLimitConfig { max_requests: 5, window: Duration::from_secs(60), burst: 2 });
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..7 {
            assert!(matches!(limiter.check(ip), Verdict::Allowed));
        }
        assert!(matches!(limiter.check(ip), Verdict::Exceeded { .. }));
    }
}
