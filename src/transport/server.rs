//! Fast-path transport server: a UNIX domain socket listener (spec.md §5).
//! Each accepted connection is handled on its own task; every inbound frame
//! is handed to a single boxed-future handler so gate evaluation (which
//! never awaits) and order dispatch (which does) can share one call shape.
//! Grounded on the teacher's `edge::receiver` forwarding loop (bind,
//! per-connection stats, graceful error handling).

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::codec::Frame;

/// A handler invoked once per inbound frame; returns the reply frame to
/// write back on the same connection.
pub type FrameHandler = Arc<dyn Fn(Frame) -> Pin<Box<dyn Future<Output = Frame> + Send>> + Send + Sync>;

pub struct TransportServer {
    socket_path: PathBuf,
    handler: FrameHandler,
}

impl TransportServer {
    pub fn new(socket_path: PathBuf, handler: FrameHandler) -> Self {
        Self { socket_path, handler }
    }

    /// Binds the socket (removing any stale socket file first) and serves
    /// connections until the process exits.
    pub async fn serve(&self) -> std::io::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!(path = %self.socket_path.display(), "transport server listening");

        loop {
            let (stream, _) = listener.accept().await?;
            let handler = self.handler.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, handler).await {
                    tracing::warn!(error = %err, "transport connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(stream: UnixStream, handler: FrameHandler) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let frame = match Frame::try_from_line(&line) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "dropping unparseable frame");
                continue;
            }
        };

        let reply = handler(frame).await;
        match reply.to_line() {
            Ok(out) => write_half.write_all(out.as_bytes()).await?,
            Err(err) => tracing::warn!(error = %err, "failed to serialize reply"),
        }
    }
    Ok(())
}
