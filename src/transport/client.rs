//! Fast-path transport client: a duplex UNIX-domain-socket connection with
//! a correlation-keyed pending-request table, exponential-backoff
//! reconnect, and backpressure on the send queue. Grounded on the teacher's
//! `edge::client::EdgeReceiverClient` (connection state, reconnect via
//! `EdgeFallbackController`, dedicated recv loop) generalized from a raw UDP
//! tick receiver to a request/response RPC client per spec.md §4.B.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::codec::{Frame, Payload};
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TransportClientConfig {
    pub socket_path: std::path::PathBuf,
    pub source: String,
    pub message_timeout: std::time::Duration,
    pub max_reconnect_delay: std::time::Duration,
    pub max_reconnect_attempts: u32,
    pub send_queue_high_water: usize,
}

struct Pending {
    table: SyncMutex<HashMap<String, oneshot::Sender<Frame>>>,
}

/// A connected fast-path client. One instance owns one socket connection;
/// reconnection replaces the internal writer handle but keeps the pending
/// table (in-flight requests at the moment of disconnect are failed with
/// `NotConnected` rather than silently dropped).
pub struct TransportClient {
    config: TransportClientConfig,
    secret: Vec<u8>,
    state: SyncMutex<ConnectionState>,
    writer: AsyncMutex<Option<tokio::net::unix::OwnedWriteHalf>>,
    pending: Arc<Pending>,
    in_flight: AtomicU64,
    correlation_seq: AtomicU64,
}

impl TransportClient {
    pub fn new(config: TransportClientConfig, secret: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            config,
            secret,
            state: SyncMutex::new(ConnectionState::Disconnected),
            writer: AsyncMutex::new(None),
            pending: Arc::new(Pending { table: SyncMutex::new(HashMap::new()) }),
            in_flight: AtomicU64::new(0),
            correlation_seq: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Connects once, with exponential backoff retried up to
    /// `max_reconnect_attempts`. On exhaustion, sets state to `Failed`.
    pub async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        *self.state.lock() = ConnectionState::Connecting;
        let mut attempt = 0u32;
        loop {
            match UnixStream::connect(&self.config.socket_path).await {
                Ok(stream) => {
                    let (read_half, write_half) = stream.into_split();
                    *self.writer.lock().await = Some(write_half);
                    *self.state.lock() = ConnectionState::Connected;
                    self.spawn_reader(read_half);
                    return Ok(());
                }
                Err(_) => {
                    attempt += 1;
                    if attempt > self.config.max_reconnect_attempts {
                        *self.state.lock() = ConnectionState::Failed;
                        return Err(TransportError::MaxReconnectReached);
                    }
                    *self.state.lock() = ConnectionState::Reconnecting;
                    let base = std::time::Duration::from_millis(50);
                    let backoff = (base * 2u32.pow(attempt.min(10))).min(self.config.max_reconnect_delay);
                    let jitter = std::time::Duration::from_millis(jitter_ms());
                    tokio::time::sleep(backoff + jitter).await;
                }
            }
        }
    }

    fn spawn_reader(self: &Arc<Self>, read_half: tokio::net::unix::OwnedReadHalf) {
        let pending = self.pending.clone();
        let this = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Ok(frame) = Frame::try_from_line(&line) {
                            if let Some(sender) = pending.table.lock().remove(&frame.correlation_id) {
                                let _ = sender.send(frame);
                            }
                        }
                    }
                    _ => {
                        *this.state.lock() = ConnectionState::Disconnected;
                        Self::fail_all_pending(&pending);
                        break;
                    }
                }
            }
        });
    }

    fn fail_all_pending(pending: &Pending) {
        let mut table = pending.table.lock();
        table.clear();
    }

    fn next_correlation_id(&self) -> String {
        let n = self.correlation_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.config.source, n)
    }

    /// Sends `payload`, suspending until a reply with a matching
    /// `correlation_id` arrives or `message_timeout` elapses. Enforces
    /// `send_queue_high_water` as backpressure on the number of in-flight
    /// requests (spec.md §4.B). Dropping the returned future before it
    /// resolves cancels the request: the pending entry is reclaimed by the
    /// timeout path or, on the next reader failure sweep, by
    /// `fail_all_pending`.
    pub async fn request(&self, payload: Payload) -> Result<Frame, TransportError> {
        if self.in_flight.load(Ordering::Relaxed) as usize >= self.config.send_queue_high_water {
            return Err(TransportError::Backpressure);
        }
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        let correlation_id = self.next_correlation_id();
        let frame = Frame::sign(correlation_id.clone(), &self.config.source, payload, &self.secret)
            .map_err(|_| TransportError::NotConnected)?;
        let line = frame.to_line().map_err(|_| TransportError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        self.pending.table.lock().insert(correlation_id.clone(), tx);
        self.in_flight.fetch_add(1, Ordering::Relaxed);

        let write_result = {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                Some(writer) => writer.write_all(line.as_bytes()).await.map_err(|_| TransportError::NotConnected),
                None => Err(TransportError::NotConnected),
            }
        };

        if write_result.is_err() {
            self.pending.table.lock().remove(&correlation_id);
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            return Err(TransportError::NotConnected);
        }

        let reply = tokio::time::timeout(self.config.message_timeout, rx).await;
        self.in_flight.fetch_sub(1, Ordering::Relaxed);

        match reply {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => {
                self.pending.table.lock().remove(&correlation_id);
                Err(TransportError::Timeout)
            }
        }
    }
}

fn jitter_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_millis() as u64 % 50).unwrap_or(0)
}
