//! Framed ESL messages and typed reply views

use crate::constants::{
    CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_AUTH_REQUEST, CONTENT_TYPE_COMMAND_REPLY,
    CONTENT_TYPE_DISCONNECT_NOTICE, CONTENT_TYPE_TEXT_EVENT_PLAIN, HEADER_CONTENT_TYPE,
    HEADER_REPLY_TEXT,
};
use serde::{Deserialize, Serialize};

/// Insertion-ordered header map with unique, case-sensitive keys.
///
/// ESL messages carry few headers, so lookups are linear scans; what matters
/// is that iteration reproduces wire order exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Create an empty header map.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Look up a header value by name (case-sensitive).
    pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = name.as_ref();
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether a header with the given name exists.
    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.get(name).is_some()
    }

    /// Set a header, replacing any existing value under the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    /// Iterate headers in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Classification of a framed message by its `Content-Type` header.
///
/// Unknown content types are carried through as
/// [`Unknown`](ContentType::Unknown) so new FreeSWITCH message kinds never
/// break the receive pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ContentType {
    /// Authentication request from the server (`auth/request`).
    AuthRequest,
    /// Command reply (`command/reply`).
    CommandReply,
    /// API response (`api/response`).
    ApiResponse,
    /// Plain-text event (`text/event-plain`).
    EventPlain,
    /// Disconnect notice (`text/disconnect-notice`).
    DisconnectNotice,
    /// Any other content type, passed through untouched.
    Unknown(String),
}

impl ContentType {
    /// Classify a raw `Content-Type` header value.
    pub fn from_header(content_type: &str) -> Self {
        match content_type {
            CONTENT_TYPE_AUTH_REQUEST => ContentType::AuthRequest,
            CONTENT_TYPE_COMMAND_REPLY => ContentType::CommandReply,
            CONTENT_TYPE_API_RESPONSE => ContentType::ApiResponse,
            CONTENT_TYPE_TEXT_EVENT_PLAIN => ContentType::EventPlain,
            CONTENT_TYPE_DISCONNECT_NOTICE => ContentType::DisconnectNotice,
            other => ContentType::Unknown(other.to_string()),
        }
    }

    /// The wire-format content-type string.
    pub fn as_str(&self) -> &str {
        match self {
            ContentType::AuthRequest => CONTENT_TYPE_AUTH_REQUEST,
            ContentType::CommandReply => CONTENT_TYPE_COMMAND_REPLY,
            ContentType::ApiResponse => CONTENT_TYPE_API_RESPONSE,
            ContentType::EventPlain => CONTENT_TYPE_TEXT_EVENT_PLAIN,
            ContentType::DisconnectNotice => CONTENT_TYPE_DISCONNECT_NOTICE,
            ContentType::Unknown(other) => other,
        }
    }
}

/// A framed ESL message: ordered headers plus an optional
/// content-length-delimited body.
///
/// A body is present iff the message declared a non-zero `Content-Length`;
/// absent and empty-with-zero-length are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EslMessage {
    headers: Headers,
    body: Option<String>,
}

impl EslMessage {
    /// Assemble a message from parsed parts.
    pub(crate) fn new(headers: Headers, body: Option<String>) -> Self {
        Self { headers, body }
    }

    /// All headers in wire order.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Look up a header by name.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers.get(name)
    }

    /// The message body, if the message declared one.
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Classify the message by `Content-Type`. `None` when the header is
    /// missing entirely (the message is still delivered; classifiers skip it).
    pub fn content_type(&self) -> Option<ContentType> {
        self.headers
            .get(HEADER_CONTENT_TYPE)
            .map(ContentType::from_header)
    }
}

/// Typed view over a `command/reply` message.
///
/// Success iff `Reply-Text` starts with `+OK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    message: EslMessage,
}

impl CommandReply {
    /// Wrap a framed `command/reply` message.
    pub fn new(message: EslMessage) -> Self {
        Self { message }
    }

    /// `true` if `Reply-Text` starts with `+OK`.
    pub fn success(&self) -> bool {
        self.reply_text()
            .is_some_and(|t| t.starts_with("+OK"))
    }

    /// Raw `Reply-Text` header value.
    pub fn reply_text(&self) -> Option<&str> {
        self.message.header(HEADER_REPLY_TEXT)
    }

    /// Error text after the `-ERR ` prefix, if the reply is an error.
    pub fn error_message(&self) -> Option<&str> {
        self.reply_text()?.strip_prefix("-ERR ")
    }

    /// Look up a reply header by name. Outbound `connect` replies carry the
    /// full channel state here.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.message.header(name)
    }

    /// All reply headers.
    pub fn headers(&self) -> &Headers {
        self.message.headers()
    }

    /// The underlying framed message.
    pub fn into_message(self) -> EslMessage {
        self.message
    }
}

/// Typed view over an `api/response` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    body: String,
}

impl ApiResponse {
    /// Wrap a framed `api/response` message, trimming trailing newlines from
    /// the body.
    pub fn new(message: EslMessage) -> Self {
        let body = message
            .body()
            .unwrap_or_default()
            .trim_end_matches('\n')
            .to_string();
        Self { body }
    }

    /// Whether the command succeeded.
    ///
    /// Defined as: body is non-empty AND (body starts with `-ERR no reply`
    /// OR the first character is not `-`). FreeSWITCH answers `-ERR no reply`
    /// for commands that legitimately return nothing, so that anomaly counts
    /// as success; the error text stays readable via
    /// [`error_message()`](Self::error_message) for diagnostics.
    pub fn success(&self) -> bool {
        !self.body.is_empty()
            && (self.body.starts_with("-ERR no reply") || !self.body.starts_with('-'))
    }

    /// The response body with trailing newlines removed.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Error text after the `-ERR ` prefix, if present.
    pub fn error_message(&self) -> Option<&str> {
        self.body.strip_prefix("-ERR ")
    }
}
