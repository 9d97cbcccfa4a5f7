//! Protocol constants and configuration values

use std::time::Duration;

/// Default FreeSWITCH ESL port for inbound connections
pub const DEFAULT_ESL_PORT: u16 = 8021;

/// Socket buffer size for reading from the TCP stream (64KB) - standard TCP receive window
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Maximum single message size (8MB) - validates Content-Length header
/// No legitimate ESL message should exceed this (largest is sofia status ~1-2MB)
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Capacity of the per-connection broadcast channel carrying framed messages.
/// Subscribers that fall more than this far behind observe a lag marker.
pub const MESSAGE_QUEUE_SIZE: usize = 1024;

/// Terminator ending a header block (and a body-less command).
pub const HEADER_TERMINATOR: &str = "\n\n";

/// Separator between a header name and its value on the wire.
pub const HEADER_SEPARATOR: &str = ": ";

/// Content-Type header values
pub const CONTENT_TYPE_AUTH_REQUEST: &str = "auth/request";
pub const CONTENT_TYPE_COMMAND_REPLY: &str = "command/reply";
pub const CONTENT_TYPE_API_RESPONSE: &str = "api/response";
pub const CONTENT_TYPE_TEXT_EVENT_PLAIN: &str = "text/event-plain";
pub const CONTENT_TYPE_DISCONNECT_NOTICE: &str = "text/disconnect-notice";

/// Protocol framing header names (not event payload - these stay as constants).
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
/// Protocol framing header: body length.
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
/// Protocol framing header: command reply status.
pub const HEADER_REPLY_TEXT: &str = "Reply-Text";

/// Default command response timeout. Configurable per connection via
/// [`ConnectionConfig`](crate::ConnectionConfig).
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `exit` waits for the server's `text/disconnect-notice` after the
/// command reply. Expiry is treated as a successful exit. Not configurable.
pub const DISCONNECT_NOTICE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default timeout for the inbound handshake (TCP connect and `auth/request`).
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
