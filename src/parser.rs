//! ESL message framing
//!
//! Reconstructs framed messages from the normalized (LF-only) byte stream:
//! a header block terminated by a blank line, optionally followed by exactly
//! `Content-Length` body bytes.

use crate::constants::{HEADER_CONTENT_LENGTH, HEADER_SEPARATOR, MAX_MESSAGE_SIZE};
use crate::error::{EslError, EslResult};
use crate::message::{EslMessage, Headers};
use tracing::trace;

#[derive(Debug)]
enum ParseState {
    /// Accumulating header bytes until the `\n\n` terminator.
    Headers,
    /// Accumulating exactly `remaining` body bytes.
    Body { remaining: usize },
    /// A full message is ready for extraction.
    Complete,
}

/// Single-message parser: a restartable state machine fed one byte at a time.
///
/// Once a message completes the instance is consumed via
/// [`extract()`](MessageParser::extract); subsequent bytes belong to the next
/// message and must go to a fresh parser. [`Framer`] handles that chaining.
#[derive(Debug)]
pub struct MessageParser {
    state: ParseState,
    header_buf: Vec<u8>,
    headers: Headers,
    body_buf: Vec<u8>,
    body: Option<String>,
}

impl MessageParser {
    /// Create a parser positioned at the start of a message.
    pub fn new() -> Self {
        Self {
            state: ParseState::Headers,
            header_buf: Vec::new(),
            headers: Headers::new(),
            body_buf: Vec::new(),
            body: None,
        }
    }

    /// Whether a complete message is ready for [`extract()`](Self::extract).
    pub fn is_complete(&self) -> bool {
        matches!(self.state, ParseState::Complete)
    }

    /// Feed one byte into the state machine.
    pub fn feed(&mut self, byte: u8) -> EslResult<()> {
        match self.state {
            ParseState::Headers => {
                self.header_buf.push(byte);
                if self.header_buf.len() > MAX_MESSAGE_SIZE {
                    return Err(EslError::protocol_error(
                        "header block exceeds maximum message size",
                    ));
                }
                if self.header_buf.ends_with(b"\n\n") {
                    self.finish_headers()?;
                }
                Ok(())
            }
            ParseState::Body { remaining } => {
                self.body_buf.push(byte);
                let remaining = remaining - 1;
                if remaining == 0 {
                    let bytes = std::mem::take(&mut self.body_buf);
                    let body = String::from_utf8(bytes)
                        .map_err(|_| EslError::protocol_error("invalid UTF-8 in message body"))?;
                    self.body = Some(body);
                    self.state = ParseState::Complete;
                } else {
                    self.state = ParseState::Body { remaining };
                }
                Ok(())
            }
            ParseState::Complete => Err(EslError::protocol_error(
                "byte fed to a parser that already holds a complete message",
            )),
        }
    }

    /// Consume the parser and return the completed message.
    ///
    /// Panics if called before [`is_complete()`](Self::is_complete) - the
    /// framer upholds that ordering.
    pub fn extract(self) -> EslMessage {
        debug_assert!(matches!(self.state, ParseState::Complete));
        EslMessage::new(self.headers, self.body)
    }

    fn finish_headers(&mut self) -> EslResult<()> {
        let raw = std::mem::take(&mut self.header_buf);
        let text = String::from_utf8(raw)
            .map_err(|_| EslError::protocol_error("invalid UTF-8 in message headers"))?;

        for line in text.split('\n') {
            if line.is_empty() {
                continue;
            }
            match line.split_once(HEADER_SEPARATOR) {
                Some((name, value)) => self.headers.insert(name, value),
                // FreeSWITCH never emits separator-less lines; skipping keeps
                // the framer restartable instead of killing the connection.
                None => trace!(line, "skipping header line without separator"),
            }
        }

        match self.headers.get(HEADER_CONTENT_LENGTH) {
            Some(value) => {
                let length: usize = value.trim().parse().map_err(|_| {
                    EslError::protocol_error(format!("malformed Content-Length: {value:?}"))
                })?;
                if length > MAX_MESSAGE_SIZE {
                    return Err(EslError::protocol_error(format!(
                        "Content-Length {length} exceeds limit {MAX_MESSAGE_SIZE}"
                    )));
                }
                if length > 0 {
                    self.body_buf = Vec::with_capacity(length);
                    self.state = ParseState::Body { remaining: length };
                } else {
                    self.state = ParseState::Complete;
                }
            }
            None => self.state = ParseState::Complete,
        }
        Ok(())
    }
}

impl Default for MessageParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Chains [`MessageParser`] instances over a continuous byte stream.
///
/// One [`feed()`](Framer::feed) call can complete zero or more messages
/// depending on where the chunk boundaries fall.
#[derive(Debug, Default)]
pub struct Framer {
    parser: MessageParser,
}

impl Framer {
    /// Create a framer positioned at a message boundary.
    pub fn new() -> Self {
        Self {
            parser: MessageParser::new(),
        }
    }

    /// Feed a chunk of bytes, returning every message completed by it.
    ///
    /// A framing error is fatal: the framer must be discarded along with the
    /// connection that produced the bytes.
    pub fn feed(&mut self, bytes: &[u8]) -> EslResult<Vec<EslMessage>> {
        let mut messages = Vec::new();
        for &byte in bytes {
            self.parser.feed(byte)?;
            if self.parser.is_complete() {
                let parser = std::mem::replace(&mut self.parser, MessageParser::new());
                messages.push(parser.extract());
            }
        }
        Ok(messages)
    }
}
