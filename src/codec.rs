//! Module A — Wire Codec.
//!
//! Frames are length-delimited (newline-terminated) canonical-JSON objects,
//! HMAC-SHA256 signed over the canonicalized `payload`. Grounded on the
//! teacher's `edge::wire` frame shape (magic/version/checksum, typed parse
//! errors, `try_from_slice`) and `vault::execution::sign_request`'s canonical
//! message + HMAC signing style, generalized from a binary tick frame to a
//! textual control/intent frame per spec.md §4.A/§6.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::config::canonical_json_bytes;
use crate::error::{SecurityError, ShapeError};

type HmacSha256 = Hmac<Sha256>;

/// Payload discriminant, per spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    #[serde(rename = "intent.prepare")]
    IntentPrepare { intent: Value },
    #[serde(rename = "intent.confirm")]
    IntentConfirm { intent_id: String },
    #[serde(rename = "intent.abort")]
    IntentAbort { intent_id: String },
    #[serde(rename = "operator.cmd")]
    OperatorCmd { command: Value },
    #[serde(rename = "ping")]
    Ping,
    // Reply variants
    Prepared { intent_id: String, position_size: f64 },
    Rejected { reason: String },
    Executed { intent_id: String },
    Aborted { intent_id: String },
    Pong,
    Error { message: String },
}

/// Headers carried on every frame, per spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameHeaders {
    pub source: String,
    pub hmac: String,
}

/// A single wire frame. `headers.hmac` is populated by [`Frame::sign`] and
/// excluded from the bytes that are signed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub correlation_id: String,
    pub timestamp: u64,
    pub headers: FrameHeaders,
    pub payload: Payload,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

/// Bytes signed for a frame: the canonical JSON encoding of
/// `(correlation_id, timestamp, source, payload)`, excluding `hmac` itself,
/// per spec.md §4.A.
fn signable_bytes(
    correlation_id: &str,
    timestamp: u64,
    source: &str,
    payload: &Payload,
) -> anyhow::Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Signable<'a> {
        correlation_id: &'a str,
        timestamp: u64,
        source: &'a str,
        payload: &'a Payload,
    }
    canonical_json_bytes(&Signable {
        correlation_id,
        timestamp,
        source,
        payload,
    })
}

impl Frame {
    /// Builds and signs a new frame using `secret`.
    pub fn sign(
        correlation_id: impl Into<String>,
        source: impl Into<String>,
        payload: Payload,
        secret: &[u8],
    ) -> anyhow::Result<Self> {
        let correlation_id = correlation_id.into();
        let source = source.into();
        let timestamp = now_millis();
        let bytes = signable_bytes(&correlation_id, timestamp, &source, &payload)?;

        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
        mac.update(&bytes);
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(Self {
            correlation_id,
            timestamp,
            headers: FrameHeaders { source, hmac: signature },
            payload,
        })
    }

    /// Verifies the signature and freshness of this frame. Constant-time MAC
    /// comparison via `hmac::Mac::verify_slice`.
    pub fn verify(&self, secret: &[u8], clock_skew: std::time::Duration) -> Result<(), SecurityError> {
        let now = now_millis();
        let skew = clock_skew.as_millis() as u64;
        let delta = now.abs_diff(self.timestamp);
        if delta > skew {
            return Err(SecurityError::Stale);
        }

        let bytes = signable_bytes(
            &self.correlation_id,
            self.timestamp,
            &self.headers.source,
            &self.payload,
        )
        .map_err(|_| SecurityError::SignatureMismatch)?;

        let expected = hex::decode(&self.headers.hmac).map_err(|_| SecurityError::SignatureMismatch)?;
        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
        mac.update(&bytes);
        mac.verify_slice(&expected)
            .map_err(|_| SecurityError::SignatureMismatch)
    }

    /// Serializes this frame as a single newline-terminated JSON line.
    pub fn to_line(&self) -> anyhow::Result<String> {
        let mut s = serde_json::to_string(self)?;
        s.push('\n');
        Ok(s)
    }

    /// Parses a single newline-delimited JSON line into a frame.
    pub fn try_from_line(line: &str) -> Result<Self, ShapeError> {
        serde_json::from_str(line.trim_end_matches('\n'))
            .map_err(|e| ShapeError::InvalidFrame(e.to_string()))
    }
}

/// Tracks recently-seen `correlation_id`s to reject replays within
/// `replay_window` (default 30s), per spec.md §4.A.
pub struct ReplayGuard {
    window: std::time::Duration,
    seen: VecDeque<(String, std::time::Instant)>,
}

impl ReplayGuard {
    pub fn new(window: std::time::Duration) -> Self {
        Self { window, seen: VecDeque::new() }
    }

    /// Returns `Err(ReplayDetected)` if `correlation_id` was already admitted
    /// within the window; otherwise records it and returns `Ok(())`.
    pub fn check_and_record(&mut self, correlation_id: &str) -> Result<(), SecurityError> {
        let now = std::time::Instant::now();
        while let Some((_, seen_at)) = self.seen.front() {
            if now.duration_since(*seen_at) > self.window {
                self.seen.pop_front();
            } else {
                break;
            }
        }
        if self.seen.iter().any(|(id, _)| id == correlation_id) {
            return Err(SecurityError::ReplayDetected(correlation_id.to_string()));
        }
        self.seen.push_back((correlation_id.to_string(), now));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn roundtrip_sign_and_verify() {
        let frame = Frame::sign("corr-1", "phase-a", Payload::Ping, SECRET).unwrap();
        frame.verify(SECRET, std::time::Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let mut frame = Frame::sign("corr-2", "phase-a", Payload::Ping, SECRET).unwrap();
        frame.payload = Payload::Pong;
        let err = frame.verify(SECRET, std::time::Duration::from_secs(5)).unwrap_err();
        assert_eq!(err, SecurityError::SignatureMismatch);
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let frame = Frame::sign("corr-3", "phase-a", Payload::Ping, SECRET).unwrap();
        let err = frame.verify(b"different-secret-different-secret", std::time::Duration::from_secs(5)).unwrap_err();
        assert_eq!(err, SecurityError::SignatureMismatch);
    }

    #[test]
    fn stale_frame_is_rejected() {
        let mut frame = Frame::sign("corr-4", "phase-a", Payload::Ping, SECRET).unwrap();
        frame.timestamp -= 60_000;
        // re-sign is skipped deliberately: we want to assert staleness is
        // checked before signature failure would also apply, so construct a
        // frame whose signature still matches its (now old) timestamp.
        let bytes = signable_bytes(&frame.correlation_id, frame.timestamp, &frame.headers.source, &frame.payload).unwrap();
        let mut mac = HmacSha256::new_from_slice(SECRET).unwrap();
        mac.update(&bytes);
        frame.headers.hmac = hex::encode(mac.finalize().into_bytes());

        let err = frame.verify(SECRET, std::time::Duration::from_secs(5)).unwrap_err();
        assert_eq!(err, SecurityError::Stale);
    }

    #[test]
    fn line_roundtrip() {
        let frame = Frame::sign("corr-5", "phase-a", Payload::IntentAbort { intent_id: "I1".into() }, SECRET).unwrap();
        let line = frame.to_line().unwrap();
        let parsed = Frame::try_from_line(&line).unwrap();
        assert_eq!(frame, parsed);
    }

    #[test]
    fn invalid_line_is_shape_error() {
        let err = Frame::try_from_line("not json").unwrap_err();
        assert!(matches!(err, ShapeError::InvalidFrame(_)));
    }

    #[test]
    fn replay_guard_rejects_second_use() {
        let mut guard = ReplayGuard::new(std::time::Duration::from_secs(30));
        guard.check_and_record("corr-x").unwrap();
        let err = guard.check_and_record("corr-x").unwrap_err();
        assert_eq!(err, SecurityError::ReplayDetected("corr-x".to_string()));
    }

    #[test]
    fn replay_guard_allows_after_window_expires() {
        let mut guard = ReplayGuard::new(std::time::Duration::from_millis(10));
        guard.check_and_record("corr-y").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        guard.check_and_record("corr-y").unwrap();
    }
}
