//! TCP transport: atomic writes, the reader task, and lifecycle
//!
//! One reader task per connection pulls bytes off the socket, normalizes
//! CRLF to LF (ESL allows either; the framer requires LF), feeds the framer
//! and broadcasts every completed message. Writes go through a mutex so a
//! command is never interleaved with another command's bytes on the wire.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::{ConnectionShared, DisconnectReason};
use crate::constants::SOCKET_BUF_SIZE;
use crate::error::{EslError, EslResult};
use crate::message::{ContentType, EslMessage};
use crate::parser::Framer;

/// Stateful CRLF-to-LF normalizer.
///
/// A CR at the end of one chunk may pair with an LF at the start of the
/// next, so one byte of state carries across calls. A CR not followed by LF
/// is passed through untouched.
#[derive(Debug, Default)]
pub(crate) struct CrlfNormalizer {
    pending_cr: bool,
}

impl CrlfNormalizer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn normalize(&mut self, input: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(input.len() + 1);
        for &byte in input {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    output.push(b'\n');
                    continue;
                }
                output.push(b'\r');
            }
            if byte == b'\r' {
                self.pending_cr = true;
            } else {
                output.push(byte);
            }
        }
        output
    }
}

/// Write side of a connection.
///
/// Disposal is idempotent: the first call shuts the socket down, later calls
/// are no-ops. Sends after disposal fail with [`EslError::Disposed`].
pub(crate) struct Transport {
    writer: Mutex<Option<OwnedWriteHalf>>,
    cancel: CancellationToken,
}

impl Transport {
    pub(crate) fn new(writer: OwnedWriteHalf, cancel: CancellationToken) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
            cancel,
        }
    }

    /// Write one complete command atomically.
    pub(crate) async fn send(&self, wire: &str) -> EslResult<()> {
        if self.cancel.is_cancelled() {
            return Err(EslError::Disposed);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(EslError::Disposed)?;
        match writer.write_all(wire.as_bytes()).await {
            Ok(()) => Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::NotConnected
                ) =>
            {
                Err(EslError::NotConnected)
            }
            Err(e) => Err(EslError::Io(e)),
        }
    }

    /// Shut the write half down. Safe to call repeatedly.
    pub(crate) async fn dispose(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("socket shutdown: {e}");
            }
        }
    }
}

/// Background reader task for one connection.
pub(crate) async fn reader_loop(
    reader: OwnedReadHalf,
    shared: Arc<ConnectionShared>,
    message_tx: broadcast::Sender<EslMessage>,
) {
    let inner = std::panic::AssertUnwindSafe(reader_loop_inner(
        reader,
        shared.clone(),
        message_tx,
    ));
    if futures_util::FutureExt::catch_unwind(inner).await.is_err() {
        tracing::error!("reader task panicked");
        shared.mark_dead(DisconnectReason::IoError("reader task panicked".to_string()));
    }
}

async fn reader_loop_inner(
    mut reader: OwnedReadHalf,
    shared: Arc<ConnectionShared>,
    message_tx: broadcast::Sender<EslMessage>,
) {
    let mut framer = Framer::new();
    let mut normalizer = CrlfNormalizer::new();
    let mut read_buffer = [0u8; SOCKET_BUF_SIZE];

    loop {
        let bytes_read = tokio::select! {
            _ = shared.cancelled() => {
                debug!("reader stopping: connection disposed");
                return;
            }
            result = reader.read(&mut read_buffer) => match result {
                Ok(0) => {
                    info!("connection closed by peer");
                    shared.mark_dead(DisconnectReason::ConnectionClosed);
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("read error: {e}");
                    shared.mark_dead(DisconnectReason::IoError(e.to_string()));
                    return;
                }
            }
        };

        trace!(bytes = bytes_read, "read from socket");
        let normalized = normalizer.normalize(&read_buffer[..bytes_read]);

        match framer.feed(&normalized) {
            Ok(messages) => {
                for message in messages {
                    trace!(content_type = ?message.content_type(), "framed message");
                    let is_disconnect_notice =
                        message.content_type() == Some(ContentType::DisconnectNotice);
                    // Publish before acting on it so a pending `exit`
                    // transaction observes the notice.
                    if message_tx.send(message).is_err() {
                        // Every receiver is gone, i.e. the connection handle
                        // was dropped without dispose.
                        debug!("all message receivers dropped; reader exiting");
                        return;
                    }
                    if is_disconnect_notice {
                        info!("received disconnect notice from server");
                        shared.mark_dead(DisconnectReason::ServerNotice);
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("framing error: {e}");
                shared.mark_dead(DisconnectReason::ProtocolViolation(e.to_string()));
                return;
            }
        }
    }
}
