//! Crate-wide error taxonomy, per the fatal/security/shape/gate/transport/venue/
//! reconciliation kinds. Fatal startup errors are surfaced through `anyhow` at
//! the binary edge; every other layer matches on these typed variants.

use thiserror::Error;

/// Errors that must abort process startup before any socket is opened.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("declared stream spec for {stream} diverged from the compiled-in spec")]
    StreamSpecDrift { stream: String },

    #[error("policy hash mismatch: core has {core_hash}, handshake reported {peer_hash}")]
    PolicyMismatch { core_hash: String, peer_hash: String },

    #[error("required secret {name} is missing or shorter than {min_len} bytes")]
    MissingSecret { name: String, min_len: usize },
}

/// Codec/transport-layer security failures (spec.md §4.A, §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("HMAC signature did not match the canonical payload")]
    SignatureMismatch,

    #[error("correlation_id {0} was already seen within the replay window")]
    ReplayDetected(String),

    #[error("frame timestamp is outside the allowed clock skew budget")]
    Stale,

    #[error("caller is not authorized for this command")]
    Unauthorized,
}

/// Frame/payload shape failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("frame could not be parsed: {0}")]
    InvalidFrame(String),

    #[error("intent payload is malformed: {0}")]
    MalformedIntent(String),

    #[error("intent_id {0} has already been submitted")]
    Duplicate(String),
}

/// Gate-chain rejection reasons (spec.md §4.E). Every variant is a terminal,
/// expected outcome: logged and counted, never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("system is not ARMED")]
    SystemDisarmed,

    #[error("system posture is HALTED")]
    SystemHalted,

    #[error("intent policy_hash does not match the active policy")]
    PolicyMismatch,

    #[error("venue {0} is not in the allowed venue list")]
    VenueForbidden(String),

    #[error("symbol {0} is not in the allowed symbol list")]
    SymbolForbidden(String),

    #[error("requested size exceeds the producer's budget")]
    BudgetExceeded,

    #[error("truth score {truth} is below the minimum {min} required for new risk")]
    TruthDegraded { truth: u8, min: u8 },

    #[error("producer {0} exceeded orders-per-minute policy")]
    RateLimited(String),

    #[error("insufficient L2 liquidity: {0}")]
    LiquidityInsufficient(String),

    #[error("venue {venue} quality degraded: {reason}")]
    VenueDegraded { venue: String, reason: String },

    #[error("risk cap exceeded: {0}")]
    RiskCapExceeded(String),
}

/// Transport-layer failures (spec.md §4.B).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("send queue high-water mark exceeded")]
    Backpressure,

    #[error("operation timed out")]
    Timeout,

    #[error("maximum reconnect attempts reached")]
    MaxReconnectReached,
}

/// Classification of venue adapter failures (spec.md §4.F, §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VenueError {
    #[error("retryable venue error: {0}")]
    Retryable(String),

    #[error("terminal venue error: {0}")]
    Terminal(String),

    #[error("ambiguous venue response: {0}")]
    Ambiguous(String),
}

/// Reconciliation anomalies (spec.md §4.H, §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconciliationError {
    #[error("drift between shadow and observed position exceeded threshold: {0}")]
    Drift(String),

    #[error("shadow state does not match observed state: {0}")]
    ShadowMismatch(String),

    #[error("fill received for unknown intent_id {0}")]
    FillWithoutIntent(String),
}

/// Umbrella error returned by the intent lifecycle engine to a transport
/// caller; wraps whichever layer actually rejected the intent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntentError {
    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("intent {0} has already expired")]
    Expired(String),

    #[error("no prepared intent found for {0}")]
    NotPrepared(String),

    #[error("symbol {0} already has a prepared intent outstanding")]
    AlreadyPrepared(String),

    #[error("venue rejected intent {0}: {1}")]
    VenueRejected(String, String),

    #[error("venue retries exhausted for intent {0}")]
    VenueRetriesExhausted(String),
}
