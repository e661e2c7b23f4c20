//! Module C — Event Log / Stream Spine.
//!
//! The teacher's dependency stack carries no message-broker crate; durable
//! ordering and redelivery are built directly on `rusqlite` (bundled SQLite),
//! the same persistence crate the teacher uses for account/trade storage.
//! Subjects route to named streams; each stream has a declared spec checked
//! at boot (spec.md §4.C) and a single monotone sequence. Consumers are
//! named, durable, and explicitly acked with bounded redelivery and DLQ
//! routing on exhaustion.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::StartupError;
use crate::model::EventRecord;

/// Declared shape of a stream, checked against the stored spec at boot.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSpec {
    pub name: String,
    pub retention_secs: i64,
    pub max_age_secs: i64,
    pub max_size: i64,
    pub discard_policy: DiscardPolicy,
    pub replicas: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardPolicy {
    Old,
    New,
}

impl DiscardPolicy {
    fn as_str(self) -> &'static str {
        match self {
            DiscardPolicy::Old => "old",
            DiscardPolicy::New => "new",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "old" => Some(DiscardPolicy::Old),
            "new" => Some(DiscardPolicy::New),
            _ => None,
        }
    }
}

/// The two streams spec.md §4.C names by example; additional streams may be
/// declared by callers via [`EventLog::open`].
pub fn default_stream_specs() -> Vec<StreamSpec> {
    vec![
        StreamSpec {
            name: "TITAN_EXECUTION".to_string(),
            retention_secs: 7 * 24 * 3600,
            max_age_secs: 7 * 24 * 3600,
            max_size: 10_000_000,
            discard_policy: DiscardPolicy::Old,
            replicas: 1,
        },
        StreamSpec {
            name: "TITAN_TRUTH".to_string(),
            retention_secs: 30 * 24 * 3600,
            max_age_secs: 30 * 24 * 3600,
            max_size: 1_000_000,
            discard_policy: DiscardPolicy::Old,
            replicas: 1,
        },
    ]
}

/// `Connection` is `Send` but not `Sync`; every connection access goes
/// through this mutex so `EventLog` can be shared behind an `Arc` across
/// tasks while still serializing writes onto a single SQLite connection
/// (spec.md §5's single-writer event log).
pub struct EventLog {
    conn: parking_lot::Mutex<Connection>,
}

fn headers_to_json(headers: &BTreeMap<String, String>) -> String {
    serde_json::to_string(headers).unwrap_or_else(|_| "{}".to_string())
}

fn headers_from_json(s: &str) -> BTreeMap<String, String> {
    serde_json::from_str(s).unwrap_or_default()
}

impl EventLog {
    /// Opens (creating if absent) the event log at `path` and runs the
    /// boot-time integrity check against `specs`: a stream seen for the
    /// first time stores its spec; a stream whose stored spec diverges from
    /// `specs` fails closed with [`StartupError::StreamSpecDrift`].
    pub fn open(path: &Path, specs: &[StreamSpec]) -> Result<Self, anyhow::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS stream_specs (
                stream TEXT PRIMARY KEY,
                retention_secs INTEGER NOT NULL,
                max_age_secs INTEGER NOT NULL,
                max_size INTEGER NOT NULL,
                discard_policy TEXT NOT NULL,
                replicas INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS events (
                stream TEXT NOT NULL,
                subject TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                headers TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (stream, sequence)
            );
            CREATE TABLE IF NOT EXISTS stream_sequences (
                stream TEXT PRIMARY KEY,
                next_sequence INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS consumer_state (
                consumer TEXT NOT NULL,
                stream TEXT NOT NULL,
                last_acked_seq INTEGER NOT NULL,
                PRIMARY KEY (consumer, stream)
            );
            CREATE TABLE IF NOT EXISTS pending_deliveries (
                consumer TEXT NOT NULL,
                stream TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                delivered_at INTEGER NOT NULL,
                deliver_count INTEGER NOT NULL,
                PRIMARY KEY (consumer, stream, sequence)
            );
            CREATE TABLE IF NOT EXISTS dlq (
                stream TEXT NOT NULL,
                subject TEXT NOT NULL,
                original_sequence INTEGER NOT NULL,
                headers TEXT NOT NULL,
                payload TEXT NOT NULL,
                failure_reason TEXT NOT NULL,
                attempt_count INTEGER NOT NULL,
                routed_at INTEGER NOT NULL
            );",
        )?;

        let log = Self { conn: parking_lot::Mutex::new(conn) };
        log.check_stream_specs(specs)?;
        Ok(log)
    }

    fn check_stream_specs(&self, specs: &[StreamSpec]) -> Result<(), anyhow::Error> {
        let conn = self.conn.lock();
        for spec in specs {
            let stored: Option<(i64, i64, i64, String, u8)> = conn
                .query_row(
                    "SELECT retention_secs, max_age_secs, max_size, discard_policy, replicas
                     FROM stream_specs WHERE stream = ?1",
                    params![spec.name],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
                )
                .optional()?;

            match stored {
                None => {
                    conn.execute(
                        "INSERT INTO stream_specs
                         (stream, retention_secs, max_age_secs, max_size, discard_policy, replicas)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            spec.name,
                            spec.retention_secs,
                            spec.max_age_secs,
                            spec.max_size,
                            spec.discard_policy.as_str(),
                            spec.replicas,
                        ],
                    )?;
                }
                Some((retention, max_age, max_size, discard, replicas)) => {
                    let matches = retention == spec.retention_secs
                        && max_age == spec.max_age_secs
                        && max_size == spec.max_size
                        && DiscardPolicy::from_str(&discard) == Some(spec.discard_policy)
                        && replicas == spec.replicas;
                    if !matches {
                        return Err(StartupError::StreamSpecDrift { stream: spec.name.clone() }.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Appends a record to `stream` under `subject`, returning its
    /// monotonically increasing sequence number within the stream.
    pub fn append(
        &self,
        stream: &str,
        subject: &str,
        headers: BTreeMap<String, String>,
        payload: Value,
    ) -> Result<u64, anyhow::Error> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let next: i64 = tx
            .query_row(
                "SELECT next_sequence FROM stream_sequences WHERE stream = ?1",
                params![stream],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or(1);

        tx.execute(
            "INSERT INTO stream_sequences (stream, next_sequence) VALUES (?1, ?2)
             ON CONFLICT(stream) DO UPDATE SET next_sequence = ?2",
            params![stream, next + 1],
        )?;

        let timestamp = Utc::now().timestamp_millis();
        tx.execute(
            "INSERT INTO events (stream, subject, sequence, timestamp, headers, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                stream,
                subject,
                next,
                timestamp,
                headers_to_json(&headers),
                payload.to_string(),
            ],
        )?;
        tx.commit()?;
        Ok(next as u64)
    }

    /// Delivers up to `batch_size` unacked records to `consumer`, marking
    /// them pending with a fresh `delivered_at` and incremented
    /// `deliver_count`. Records already pending and not yet timed out are
    /// skipped; records whose redelivery has timed out are redelivered here.
    pub fn fetch_pending(
        &self,
        consumer: &str,
        stream: &str,
        ack_wait: std::time::Duration,
        max_deliver: u32,
        batch_size: u32,
    ) -> Result<Vec<EventRecord>, anyhow::Error> {
        let now = Utc::now().timestamp_millis();
        let ack_wait_ms = ack_wait.as_millis() as i64;
        let conn = self.conn.lock();

        let last_acked: i64 = conn
            .query_row(
                "SELECT last_acked_seq FROM consumer_state WHERE consumer = ?1 AND stream = ?2",
                params![consumer, stream],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or(0);

        // Expire stale pending deliveries: redeliver or DLQ.
        let mut stmt = conn.prepare(
            "SELECT sequence, delivered_at, deliver_count FROM pending_deliveries
             WHERE consumer = ?1 AND stream = ?2",
        )?;
        let stale: Vec<(i64, i64, i64)> = stmt
            .query_map(params![consumer, stream], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        let mut rearmed: Vec<i64> = Vec::new();
        for (seq, delivered_at, deliver_count) in stale {
            if now - delivered_at <= ack_wait_ms {
                continue;
            }
            if deliver_count as u32 >= max_deliver {
                Self::route_to_dlq_locked(&conn, stream, seq, "max_deliver exhausted", deliver_count as u32)?;
                conn.execute(
                    "DELETE FROM pending_deliveries WHERE consumer = ?1 AND stream = ?2 AND sequence = ?3",
                    params![consumer, stream, seq],
                )?;
            } else {
                conn.execute(
                    "UPDATE pending_deliveries SET delivered_at = ?1, deliver_count = deliver_count + 1
                     WHERE consumer = ?2 AND stream = ?3 AND sequence = ?4",
                    params![now, consumer, stream, seq],
                )?;
                rearmed.push(seq);
            }
        }

        // New records beyond last_acked that are not already pending.
        let mut stmt = conn.prepare(
            "SELECT subject, sequence, timestamp, headers, payload FROM events
             WHERE stream = ?1 AND sequence > ?2
               AND sequence NOT IN (
                   SELECT sequence FROM pending_deliveries WHERE consumer = ?3 AND stream = ?1
               )
             ORDER BY sequence ASC LIMIT ?4",
        )?;
        let rows: Vec<(String, i64, i64, String, String)> = stmt
            .query_map(params![stream, last_acked, consumer, batch_size], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            })?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        let mut out = Vec::new();
        for (subject, seq, ts, headers, payload) in rows {
            conn.execute(
                "INSERT INTO pending_deliveries (consumer, stream, sequence, delivered_at, deliver_count)
                 VALUES (?1, ?2, ?3, ?4, 1)",
                params![consumer, stream, seq, now],
            )?;
            out.push(EventRecord {
                stream: stream.to_string(),
                subject,
                sequence: seq as u64,
                timestamp: ts,
                headers: headers_from_json(&headers),
                payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            });
        }

        // Re-surface only the records actually re-armed in the stale sweep
        // above, never the fresh first-time deliveries inserted just now
        // (both share `delivered_at = now`, so matching on that column alone
        // would double-surface every new record).
        for seq in rearmed {
            let row = conn.query_row(
                "SELECT subject, sequence, timestamp, headers, payload FROM events
                 WHERE stream = ?1 AND sequence = ?2",
                params![stream, seq],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, i64>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                    ))
                },
            )?;
            let (subject, seq, ts, headers, payload) = row;
            out.push(EventRecord {
                stream: stream.to_string(),
                subject,
                sequence: seq as u64,
                timestamp: ts,
                headers: headers_from_json(&headers),
                payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            });
        }

        Ok(out)
    }

    /// Acks a delivered record: removes it from the pending table and
    /// advances `last_acked_seq` if this ack closes the contiguous prefix.
    pub fn ack(&self, consumer: &str, stream: &str, sequence: u64) -> Result<(), anyhow::Error> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM pending_deliveries WHERE consumer = ?1 AND stream = ?2 AND sequence = ?3",
            params![consumer, stream, sequence as i64],
        )?;

        let current: i64 = conn
            .query_row(
                "SELECT last_acked_seq FROM consumer_state WHERE consumer = ?1 AND stream = ?2",
                params![consumer, stream],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let min_pending: Option<i64> = conn
            .query_row(
                "SELECT MIN(sequence) FROM pending_deliveries WHERE consumer = ?1 AND stream = ?2",
                params![consumer, stream],
                |r| r.get(0),
            )
            .optional()?
            .flatten();

        let new_acked = match min_pending {
            Some(min_seq) => (min_seq - 1).max(current),
            None => current.max(sequence as i64),
        };

        conn.execute(
            "INSERT INTO consumer_state (consumer, stream, last_acked_seq) VALUES (?1, ?2, ?3)
             ON CONFLICT(consumer, stream) DO UPDATE SET last_acked_seq = ?3",
            params![consumer, stream, new_acked],
        )?;
        Ok(())
    }

    fn route_to_dlq_locked(
        conn: &Connection,
        stream: &str,
        sequence: i64,
        failure_reason: &str,
        attempt_count: u32,
    ) -> Result<(), anyhow::Error> {
        let (subject, headers, payload): (String, String, String) = conn.query_row(
            "SELECT subject, headers, payload FROM events WHERE stream = ?1 AND sequence = ?2",
            params![stream, sequence],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        conn.execute(
            "INSERT INTO dlq (stream, subject, original_sequence, headers, payload, failure_reason, attempt_count, routed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                stream,
                subject,
                sequence,
                headers,
                payload,
                failure_reason,
                attempt_count,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Subject a dead-lettered record is routed to, per spec.md §6.
    pub fn dlq_subject(stream: &str, subject: &str) -> String {
        format!("titan.dlq.v1.{stream}.{subject}")
    }

    /// Returns the number of DLQ entries for inspection/tests.
    pub fn dlq_count(&self) -> Result<u64, anyhow::Error> {
        let n: i64 = self.conn.lock().query_row("SELECT COUNT(*) FROM dlq", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn open_tmp() -> (EventLog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let log = EventLog::open(&path, &default_stream_specs()).unwrap();
        (log, dir)
    }

    #[test]
    fn append_assigns_monotone_sequence() {
        let (log, _dir) = open_tmp();
        let s1 = log.append("TITAN_EXECUTION", "titan.evt.execution.fill.v1", BTreeMap::new(), Value::Null).unwrap();
        let s2 = log.append("TITAN_EXECUTION", "titan.evt.execution.fill.v1", BTreeMap::new(), Value::Null).unwrap();
        assert_eq!(s1, 1);
        assert_eq!(s2, 2);
    }

    #[test]
    fn reopening_with_matching_spec_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        EventLog::open(&path, &default_stream_specs()).unwrap();
        EventLog::open(&path, &default_stream_specs()).unwrap();
    }

    #[test]
    fn reopening_with_diverged_spec_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        EventLog::open(&path, &default_stream_specs()).unwrap();

        let mut specs = default_stream_specs();
        specs[0].max_size = 1;
        let err = EventLog::open(&path, &specs).unwrap_err();
        assert!(err.to_string().contains("diverged"));
    }

    #[test]
    fn fetch_pending_then_ack_clears_pending() {
        let (log, _dir) = open_tmp();
        log.append("TITAN_EXECUTION", "titan.evt.execution.fill.v1", BTreeMap::new(), Value::Null).unwrap();
        let pending = log
            .fetch_pending("reconciler", "TITAN_EXECUTION", std::time::Duration::from_secs(30), 5, 10)
            .unwrap();
        assert_eq!(pending.len(), 1);
        log.ack("reconciler", "TITAN_EXECUTION", pending[0].sequence).unwrap();

        let again = log
            .fetch_pending("reconciler", "TITAN_EXECUTION", std::time::Duration::from_secs(30), 5, 10)
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn redelivery_does_not_duplicate_within_a_batch() {
        let (log, _dir) = open_tmp();
        log.append("TITAN_EXECUTION", "titan.evt.execution.fill.v1", BTreeMap::new(), Value::Null).unwrap();
        log.append("TITAN_EXECUTION", "titan.evt.execution.fill.v1", BTreeMap::new(), Value::Null).unwrap();

        // First delivery, never acked; with ack_wait=0 it is immediately stale.
        let first = log
            .fetch_pending("reconciler", "TITAN_EXECUTION", std::time::Duration::from_millis(0), 5, 10)
            .unwrap();
        assert_eq!(first.len(), 2);

        // This sweep re-arms both stale records and must not also surface
        // them a second time as "new".
        let second = log
            .fetch_pending("reconciler", "TITAN_EXECUTION", std::time::Duration::from_millis(0), 5, 10)
            .unwrap();
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn exhausted_redelivery_routes_to_dlq() {
        let (log, _dir) = open_tmp();
        log.append("TITAN_EXECUTION", "titan.evt.execution.fill.v1", BTreeMap::new(), Value::Null).unwrap();

        // First delivery, never acked.
        log.fetch_pending("reconciler", "TITAN_EXECUTION", std::time::Duration::from_millis(0), 1, 10).unwrap();
        // Immediately stale (ack_wait=0), max_deliver=1 so this sweep exhausts it.
        log.fetch_pending("reconciler", "TITAN_EXECUTION", std::time::Duration::from_millis(0), 1, 10).unwrap();

        assert_eq!(log.dlq_count().unwrap(), 1);
    }
}
