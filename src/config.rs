//! Runtime configuration and risk policy loading.
//!
//! Mirrors the teacher's `Config::from_env` idiom: read an env var, parse or
//! fall back to a documented default, fail closed only for the handful of
//! variables spec.md §6 calls critical.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StartupError;

const MIN_SECRET_LEN: usize = 32;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Process-wide runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub hmac_secret: Vec<u8>,
    pub policy_path: PathBuf,
    pub socket_path: PathBuf,
    pub log_dir: PathBuf,
    pub max_orders_per_min: u32,
    pub clock_skew_ms: u64,

    // Additional tunables named throughout spec.md §4, each documented with
    // the default spec.md states.
    pub prepare_ttl: Duration,
    pub message_timeout: Duration,
    pub replay_window: Duration,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub send_queue_high_water: usize,
    pub ack_wait: Duration,
    pub max_deliver: u32,
    pub checkpoint_interval: Duration,
    pub checkpoint_mutations: u64,
    pub venue_max_retries: u32,
    pub ack_resolve_window: Duration,
    pub allocator_period: Duration,
    pub hysteresis_window: Duration,
    pub reorder_window: Duration,
    pub drift_pct_threshold: f64,
    pub min_truth_for_new_risk: u8,
    pub defensive_truth: u8,
    pub halt_truth: u8,
    pub staleness_window: Duration,
    pub posture_tick_interval: Duration,
}

impl RuntimeConfig {
    /// Reads the environment, failing closed when a critical variable is
    /// missing or malformed per spec.md §6.
    pub fn from_env() -> Result<Self, StartupError> {
        dotenv::dotenv().ok();

        let hmac_secret = std::env::var("HMAC_SECRET")
            .map(String::into_bytes)
            .unwrap_or_default();
        if hmac_secret.len() < MIN_SECRET_LEN {
            return Err(StartupError::MissingSecret {
                name: "HMAC_SECRET".to_string(),
                min_len: MIN_SECRET_LEN,
            });
        }

        Ok(Self {
            hmac_secret,
            policy_path: PathBuf::from(
                std::env::var("POLICY_PATH").unwrap_or_else(|_| "policy.json".to_string()),
            ),
            socket_path: PathBuf::from(
                std::env::var("SOCKET_PATH").unwrap_or_else(|_| "/tmp/titan.sock".to_string()),
            ),
            log_dir: PathBuf::from(
                std::env::var("LOG_DIR").unwrap_or_else(|_| "./log".to_string()),
            ),
            max_orders_per_min: env_or("MAX_ORDERS_PER_MIN", 60),
            clock_skew_ms: env_or("CLOCK_SKEW_MS", 5_000),

            prepare_ttl: Duration::from_millis(env_or("PREPARE_TTL_MS", 750)),
            message_timeout: Duration::from_millis(env_or("MESSAGE_TIMEOUT_MS", 1_000)),
            replay_window: Duration::from_secs(env_or("REPLAY_WINDOW_SECS", 30)),
            max_reconnect_delay: Duration::from_secs(env_or("MAX_RECONNECT_DELAY_SECS", 30)),
            max_reconnect_attempts: env_or("MAX_RECONNECT_ATTEMPTS", 10),
            send_queue_high_water: env_or("SEND_QUEUE_HIGH_WATER", 1_000),
            ack_wait: Duration::from_secs(env_or("ACK_WAIT_SECS", 30)),
            max_deliver: env_or("MAX_DELIVER", 5),
            checkpoint_interval: Duration::from_secs(env_or("CHECKPOINT_INTERVAL_SECS", 60)),
            checkpoint_mutations: env_or("CHECKPOINT_MUTATIONS", 10_000),
            venue_max_retries: env_or("VENUE_MAX_RETRIES", 3),
            ack_resolve_window: Duration::from_secs(env_or("ACK_RESOLVE_WINDOW_SECS", 30)),
            allocator_period: Duration::from_secs(env_or("ALLOCATOR_PERIOD_SECS", 5)),
            hysteresis_window: Duration::from_secs(env_or("HYSTERESIS_WINDOW_SECS", 300)),
            reorder_window: Duration::from_secs(env_or("REORDER_WINDOW_SECS", 2)),
            drift_pct_threshold: env_or("DRIFT_PCT_THRESHOLD", 0.001),
            min_truth_for_new_risk: env_or("MIN_TRUTH_FOR_NEW_RISK", 70),
            defensive_truth: env_or("DEFENSIVE_TRUTH", 70),
            halt_truth: env_or("HALT_TRUTH", 40),
            staleness_window: Duration::from_secs(env_or("STALENESS_WINDOW_SECS", 120)),
            posture_tick_interval: Duration::from_millis(env_or("POSTURE_TICK_INTERVAL_MS", 1_000)),
        })
    }
}

/// Per-symbol position and leverage caps, plus the venue/symbol allow-lists,
/// as loaded from the policy file (spec.md §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskPolicy {
    pub max_position_per_symbol: BTreeMap<String, f64>,
    pub max_aggregate_leverage: f64,
    pub max_per_trade_risk_fraction: f64,
    pub daily_drawdown_limit: f64,
    pub minimum_equity: f64,
    pub emergency_stop_loss_threshold: f64,
    pub allowed_venues: Vec<String>,
    pub allowed_symbols: Vec<String>,
    pub max_orders_per_minute: u32,
    pub max_spread_bps: f64,
    pub min_depth_multiple: f64,
    pub min_stop_loss_distance_bps: f64,
}

impl RiskPolicy {
    /// Loads the policy file, rejecting unknown keys (closed configuration
    /// set, spec.md §9) since `serde_json` with `deny_unknown_fields` fails
    /// parsing rather than silently dropping them.
    pub fn load(path: &Path) -> anyhow::Result<(Self, String)> {
        let raw = std::fs::read(path)?;
        let policy: RiskPolicyStrict = serde_json::from_slice(&raw)?;
        let policy = policy.0;
        let hash = policy.canonical_hash()?;
        Ok((policy, hash))
    }

    /// SHA-256 hex digest of the canonical (sorted-key, whitespace-free)
    /// JSON encoding of this policy — the `policy_hash` of spec.md §3/§6.
    pub fn canonical_hash(&self) -> anyhow::Result<String> {
        let canonical = canonical_json_bytes(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(hex::encode(hasher.finalize()))
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RiskPolicyStrict(RiskPolicy);

/// Canonicalizes a serializable value into sorted-key, whitespace-free JSON
/// bytes, used both for the policy hash and for wire-frame signing (Module A).
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    let sorted = sort_json_keys(value);
    Ok(serde_json::to_vec(&sorted)?)
}

fn sort_json_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> = map
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, sort_json_keys(v)))
                .collect();
            serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(sort_json_keys).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_policy() -> RiskPolicy {
        let mut max_position_per_symbol = BTreeMap::new();
        max_position_per_symbol.insert("BTCUSDT".to_string(), 50_000.0);
        RiskPolicy {
            max_position_per_symbol,
            max_aggregate_leverage: 5.0,
            max_per_trade_risk_fraction: 0.02,
            daily_drawdown_limit: 0.05,
            minimum_equity: 1_000.0,
            emergency_stop_loss_threshold: 0.1,
            allowed_venues: vec!["binance".to_string()],
            allowed_symbols: vec!["BTCUSDT".to_string()],
            max_orders_per_minute: 60,
            max_spread_bps: 10.0,
            min_depth_multiple: 3.0,
            min_stop_loss_distance_bps: 20.0,
        }
    }

    #[test]
    fn canonical_hash_is_stable_under_field_reordering() {
        let policy = sample_policy();
        let h1 = policy.canonical_hash().unwrap();
        let h2 = policy.canonical_hash().unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn canonical_hash_changes_when_policy_changes() {
        let mut policy = sample_policy();
        let h1 = policy.canonical_hash().unwrap();
        policy.max_aggregate_leverage = 10.0;
        let h2 = policy.canonical_hash().unwrap();
        assert_ne!(h1, h2);
    }
}
