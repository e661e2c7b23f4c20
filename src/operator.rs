//! Module J — Operator Command Surface.
//!
//! `ARM`/`DISARM`/`HALT`/`FLATTEN`/`SET_POSTURE`/`APPLY_PRESET`, each
//! HMAC-signed by an operator key over the canonical command bytes
//! (excluding the signature field itself), with a monotonically increasing
//! per-initiator `nonce` for replay protection. Grounded on the teacher's
//! `vault::execution::sign_request` HMAC-over-canonical-message pattern
//! rather than its `auth::jwt` session-token auth, because per-command
//! signing — not session auth — is what spec.md §4.J specifies.

use std::collections::{BTreeMap, HashMap};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::canonical_json_bytes;
use crate::model::Posture;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OperatorCommand {
    Arm,
    Disarm,
    Halt,
    Flatten,
    SetPosture { posture: Posture },
    ApplyPreset { preset: String },
}

/// An operator command plus its signing envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignedCommand {
    pub command: OperatorCommand,
    pub initiator_id: String,
    pub reason: String,
    pub nonce: u64,
    pub timestamp: i64,
    pub signature: String,
}

/// Process exit codes for an operator-facing CLI, per spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Ok = 0,
    PolicyMismatch = 2,
    Disarmed = 3,
    Unauthorized = 4,
    ReplayDetected = 5,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorError {
    Unauthorized,
    ReplayDetected,
    Stale,
}

impl OperatorError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            OperatorError::Unauthorized => ExitCode::Unauthorized,
            OperatorError::ReplayDetected => ExitCode::ReplayDetected,
            OperatorError::Stale => ExitCode::Unauthorized,
        }
    }
}

fn signable_bytes(cmd: &SignedCommand) -> anyhow::Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Signable<'a> {
        command: &'a OperatorCommand,
        initiator_id: &'a str,
        reason: &'a str,
        nonce: u64,
        timestamp: i64,
    }
    canonical_json_bytes(&Signable {
        command: &cmd.command,
        initiator_id: &cmd.initiator_id,
        reason: &cmd.reason,
        nonce: cmd.nonce,
        timestamp: cmd.timestamp,
    })
}

/// Signs a new operator command. Exposed for operator-CLI callers and tests;
/// the process itself only verifies.
pub fn sign_command(
    command: OperatorCommand,
    initiator_id: impl Into<String>,
    reason: impl Into<String>,
    nonce: u64,
    timestamp: i64,
    secret: &[u8],
) -> anyhow::Result<SignedCommand> {
    let mut cmd = SignedCommand {
        command,
        initiator_id: initiator_id.into(),
        reason: reason.into(),
        nonce,
        timestamp,
        signature: String::new(),
    };
    let bytes = signable_bytes(&cmd)?;
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&bytes);
    cmd.signature = hex::encode(mac.finalize().into_bytes());
    Ok(cmd)
}

/// Verifies signature, nonce monotonicity per initiator, and clock skew;
/// tracks the highest nonce seen per initiator so replays (and regressions)
/// are rejected.
pub struct OperatorSurface {
    secret: Vec<u8>,
    clock_skew: std::time::Duration,
    last_nonce: Mutex<HashMap<String, u64>>,
    audit: Mutex<Vec<(SignedCommand, bool, String)>>,
}

impl OperatorSurface {
    pub fn new(secret: Vec<u8>, clock_skew: std::time::Duration) -> Self {
        Self { secret, clock_skew, last_nonce: Mutex::new(HashMap::new()), audit: Mutex::new(Vec::new()) }
    }

    /// Verifies a signed command. On success, advances the per-initiator
    /// nonce watermark and records an audit entry; on failure, records the
    /// rejection reason in the audit trail without advancing the watermark.
    pub fn verify(&self, cmd: &SignedCommand) -> Result<(), OperatorError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let delta = (now_ms - cmd.timestamp).unsigned_abs();
        if delta > self.clock_skew.as_millis() as u64 {
            self.record_audit(cmd, false, "stale timestamp".to_string());
            return Err(OperatorError::Stale);
        }

        let bytes = match signable_bytes(cmd) {
            Ok(b) => b,
            Err(_) => {
                self.record_audit(cmd, false, "unserializable command".to_string());
                return Err(OperatorError::Unauthorized);
            }
        };
        let expected = match hex::decode(&cmd.signature) {
            Ok(e) => e,
            Err(_) => {
                self.record_audit(cmd, false, "malformed signature".to_string());
                return Err(OperatorError::Unauthorized);
            }
        };
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(&bytes);
        if mac.verify_slice(&expected).is_err() {
            self.record_audit(cmd, false, "signature mismatch".to_string());
            return Err(OperatorError::Unauthorized);
        }

        let mut nonces = self.last_nonce.lock();
        let watermark = nonces.get(&cmd.initiator_id).copied().unwrap_or(0);
        if cmd.nonce <= watermark {
            drop(nonces);
            self.record_audit(cmd, false, "nonce replay".to_string());
            return Err(OperatorError::ReplayDetected);
        }
        nonces.insert(cmd.initiator_id.clone(), cmd.nonce);
        drop(nonces);

        self.record_audit(cmd, true, "accepted".to_string());
        Ok(())
    }

    fn record_audit(&self, cmd: &SignedCommand, accepted: bool, reason: String) {
        self.audit.lock().push((cmd.clone(), accepted, reason));
    }

    /// Flushes accumulated audit entries into the event log under
    /// `titan.evt.operator.audit.v1` (SPEC_FULL.md §0.5).
    pub fn drain_audit_to_log(&self, log: &crate::eventlog::EventLog) -> anyhow::Result<()> {
        let entries: Vec<_> = self.audit.lock().drain(..).collect();
        for (cmd, accepted, reason) in entries {
            let mut headers = BTreeMap::new();
            headers.insert("initiator_id".to_string(), cmd.initiator_id.clone());
            headers.insert("accepted".to_string(), accepted.to_string());
            log.append(
                "TITAN_EXECUTION",
                "titan.evt.operator.audit.v1",
                headers,
                serde_json::json!({ "command": cmd.command, "reason": reason, "nonce": cmd.nonce }),
            )?;
        }
        Ok(())
    }
}

/// Boot-time policy-hash handshake (spec.md §4.J): if the core's active
/// policy hash doesn't match the peer-reported hash, the process must
/// remain DISARMED.
pub fn policy_hash_handshake(core_hash: &str, peer_hash: &str) -> Result<(), crate::error::StartupError> {
    if core_hash != peer_hash {
        return Err(crate::error::StartupError::PolicyMismatch {
            core_hash: core_hash.to_string(),
            peer_hash: peer_hash.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn valid_command_is_accepted() {
        let surface = OperatorSurface::new(SECRET.to_vec(), std::time::Duration::from_secs(5));
        let cmd = sign_command(OperatorCommand::Arm, "op-1", "start of day", 1, chrono::Utc::now().timestamp_millis(), SECRET).unwrap();
        surface.verify(&cmd).unwrap();
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let surface = OperatorSurface::new(SECRET.to_vec(), std::time::Duration::from_secs(5));
        let cmd = sign_command(OperatorCommand::Arm, "op-1", "start of day", 1, chrono::Utc::now().timestamp_millis(), SECRET).unwrap();
        surface.verify(&cmd).unwrap();
        let err = surface.verify(&cmd).unwrap_err();
        assert_eq!(err, OperatorError::ReplayDetected);
        assert_eq!(err.exit_code(), ExitCode::ReplayDetected);
    }

    #[test]
    fn tampered_command_is_unauthorized() {
        let surface = OperatorSurface::new(SECRET.to_vec(), std::time::Duration::from_secs(5));
        let mut cmd = sign_command(OperatorCommand::Disarm, "op-1", "maintenance", 1, chrono::Utc::now().timestamp_millis(), SECRET).unwrap();
        cmd.command = OperatorCommand::Arm;
        let err = surface.verify(&cmd).unwrap_err();
        assert_eq!(err, OperatorError::Unauthorized);
    }

    #[test]
    fn policy_hash_handshake_rejects_mismatch() {
        let err = policy_hash_handshake("abc", "def").unwrap_err();
        assert!(matches!(err, crate::error::StartupError::PolicyMismatch { .. }));
    }

    #[test]
    fn policy_hash_handshake_accepts_match() {
        policy_hash_handshake("abc", "abc").unwrap();
    }
}
