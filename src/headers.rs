//! Typed event header names for FreeSWITCH ESL events.

use std::fmt;
use std::str::FromStr;

/// Error returned when parsing an unrecognized event header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventHeaderError(pub String);

impl fmt::Display for ParseEventHeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event header: {}", self.0)
    }
}

impl std::error::Error for ParseEventHeaderError {}

/// Header names that appear in FreeSWITCH ESL events.
///
/// These are the headers on the parsed event itself (not protocol framing
/// headers like `Content-Type`). Use with
/// [`EventMessage::header()`](crate::EventMessage::header) for type-safe
/// lookups. Parsing from the wire is case-insensitive; emission always uses
/// the canonical spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum EventHeader {
    EventName,
    EventSubclass,
    UniqueId,
    CallerUniqueId,
    OtherLegUniqueId,
    ChannelCallUuid,
    JobUuid,
    ApplicationUuid,
    Application,
    ApplicationData,
    ApplicationResponse,
    ChannelName,
    ChannelState,
    AnswerState,
    HangupCause,
    CallerDestinationNumber,
    CoreUuid,
}

impl EventHeader {
    /// Every variant, for wire-name lookups.
    const ALL: [EventHeader; 17] = [
        EventHeader::EventName,
        EventHeader::EventSubclass,
        EventHeader::UniqueId,
        EventHeader::CallerUniqueId,
        EventHeader::OtherLegUniqueId,
        EventHeader::ChannelCallUuid,
        EventHeader::JobUuid,
        EventHeader::ApplicationUuid,
        EventHeader::Application,
        EventHeader::ApplicationData,
        EventHeader::ApplicationResponse,
        EventHeader::ChannelName,
        EventHeader::ChannelState,
        EventHeader::AnswerState,
        EventHeader::HangupCause,
        EventHeader::CallerDestinationNumber,
        EventHeader::CoreUuid,
    ];

    /// The canonical wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventHeader::EventName => "Event-Name",
            EventHeader::EventSubclass => "Event-Subclass",
            EventHeader::UniqueId => "Unique-ID",
            EventHeader::CallerUniqueId => "Caller-Unique-ID",
            EventHeader::OtherLegUniqueId => "Other-Leg-Unique-ID",
            EventHeader::ChannelCallUuid => "Channel-Call-UUID",
            EventHeader::JobUuid => "Job-UUID",
            EventHeader::ApplicationUuid => "Application-UUID",
            EventHeader::Application => "Application",
            EventHeader::ApplicationData => "Application-Data",
            EventHeader::ApplicationResponse => "Application-Response",
            EventHeader::ChannelName => "Channel-Name",
            EventHeader::ChannelState => "Channel-State",
            EventHeader::AnswerState => "Answer-State",
            EventHeader::HangupCause => "Hangup-Cause",
            EventHeader::CallerDestinationNumber => "Caller-Destination-Number",
            EventHeader::CoreUuid => "Core-UUID",
        }
    }
}

impl fmt::Display for EventHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for EventHeader {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl FromStr for EventHeader {
    type Err = ParseEventHeaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventHeader::ALL
            .into_iter()
            .find(|header| header.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseEventHeaderError(s.to_string()))
    }
}
