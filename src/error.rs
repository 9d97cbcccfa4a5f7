//! Error types for the ESL client

use std::fmt;
use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type EslResult<T> = Result<T, EslError>;

/// Why an inbound connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InboundFailureReason {
    /// No `auth/request` arrived within the handshake timeout.
    Timeout,
    /// FreeSWITCH rejected the password.
    InvalidPassword,
    /// The TCP connection could not be established or broke mid-handshake.
    Transport,
}

impl fmt::Display for InboundFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundFailureReason::Timeout => write!(f, "handshake timed out"),
            InboundFailureReason::InvalidPassword => write!(f, "invalid password"),
            InboundFailureReason::Transport => write!(f, "transport error"),
        }
    }
}

/// Errors surfaced by the ESL client.
///
/// Transaction-local errors ([`Timeout`](EslError::Timeout),
/// [`CommandFailed`](EslError::CommandFailed)) leave the connection alive.
/// Byte-stream errors terminate the connection and fail every pending
/// transaction with [`Cancelled`](EslError::Cancelled).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EslError {
    /// No correlated reply arrived within the response timeout.
    /// The connection stays alive; subsequent commands may proceed.
    #[error("no reply within {timeout_ms}ms")]
    Timeout {
        /// The timeout that expired, in milliseconds.
        timeout_ms: u64,
    },

    /// The connection was disposed or the peer disconnected before the
    /// reply arrived.
    #[error("connection closed before the reply arrived")]
    Cancelled,

    /// The operation was attempted on a connection that has already
    /// terminated (locally disposed or remotely disconnected).
    #[error("connection is disposed")]
    Disposed,

    /// The write side of the socket is gone (peer closed the connection).
    #[error("not connected")]
    NotConnected,

    /// The inbound handshake failed. Produced only by
    /// [`InboundSocket`](crate::InboundSocket).
    #[error("inbound connection to {endpoint} failed: {reason}")]
    InboundConnectionFailed {
        /// What went wrong.
        reason: InboundFailureReason,
        /// The `host:port` the client was dialing.
        endpoint: String,
        /// Underlying detail (reply error text or transport error), if any.
        message: Option<String>,
    },

    /// The byte stream is ill-formed beyond recovery (bad `Content-Length`,
    /// oversized message, invalid UTF-8 body). Fatal: the connection is
    /// terminated.
    #[error("protocol violation: {message}")]
    ProtocolViolation {
        /// Human-readable description of the violation.
        message: String,
    },

    /// A command produced a `-ERR` reply. Transaction-local.
    #[error("command failed: {reply_text}")]
    CommandFailed {
        /// The raw `Reply-Text` value.
        reply_text: String,
    },

    /// An I/O error on the underlying socket.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl EslError {
    /// Shorthand for a [`ProtocolViolation`](EslError::ProtocolViolation).
    pub(crate) fn protocol_error(message: impl Into<String>) -> Self {
        EslError::ProtocolViolation {
            message: message.into(),
        }
    }
}

/// Reject user-provided command fragments containing newline characters.
///
/// ESL commands are line-delimited; embedded newlines would allow injection
/// of arbitrary protocol commands.
pub(crate) fn validate_no_newlines(s: &str, context: &str) -> EslResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(EslError::ProtocolViolation {
            message: format!("{} must not contain newlines", context),
        });
    }
    Ok(())
}
