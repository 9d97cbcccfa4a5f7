//! ESL event names and event messages

use crate::error::{EslError, EslResult};
use crate::headers::EventHeader;
use crate::message::{ContentType, EslMessage, Headers};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// Generates the `EventName` enum with wire-name conversion and an
/// `Unknown` fallback so new FreeSWITCH events never break parsing.
macro_rules! event_names {
    (
        $(
            $(#[$attr:meta])*
            $variant:ident => $wire:literal
        ),+ $(,)?
    ) => {
        /// FreeSWITCH event names matching the canonical order from
        /// `switch_event.c` EVENT_NAMES[].
        ///
        /// Variant names are the CamelCase form of the `UPPER_UNDERSCORE`
        /// wire names (e.g. `ChannelCreate` = `CHANNEL_CREATE`). Names not in
        /// the table round-trip through [`EventName::Unknown`].
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[non_exhaustive]
        #[allow(missing_docs)]
        pub enum EventName {
            $(
                $(#[$attr])*
                $variant,
            )+
            /// An event name outside the canonical table, kept verbatim
            /// (upper-cased) for wire round-tripping.
            Unknown(String),
        }

        impl EventName {
            /// The `UPPER_UNDERSCORE` wire name.
            pub fn as_str(&self) -> &str {
                match self {
                    $( EventName::$variant => $wire, )+
                    EventName::Unknown(name) => name,
                }
            }

            /// Parse a wire name (case-insensitive). Unrecognized names
            /// become [`EventName::Unknown`].
            pub fn parse(name: &str) -> Self {
                match name.to_ascii_uppercase().as_str() {
                    $( $wire => EventName::$variant, )+
                    other => EventName::Unknown(other.to_string()),
                }
            }
        }

        impl fmt::Display for EventName {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for EventName {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self::parse(s))
            }
        }
    };
}

event_names! {
    Custom => "CUSTOM",
    Clone => "CLONE",
    ChannelCreate => "CHANNEL_CREATE",
    ChannelDestroy => "CHANNEL_DESTROY",
    ChannelState => "CHANNEL_STATE",
    ChannelCallstate => "CHANNEL_CALLSTATE",
    ChannelAnswer => "CHANNEL_ANSWER",
    ChannelHangup => "CHANNEL_HANGUP",
    ChannelHangupComplete => "CHANNEL_HANGUP_COMPLETE",
    ChannelExecute => "CHANNEL_EXECUTE",
    ChannelExecuteComplete => "CHANNEL_EXECUTE_COMPLETE",
    ChannelHold => "CHANNEL_HOLD",
    ChannelUnhold => "CHANNEL_UNHOLD",
    ChannelBridge => "CHANNEL_BRIDGE",
    ChannelUnbridge => "CHANNEL_UNBRIDGE",
    ChannelProgress => "CHANNEL_PROGRESS",
    ChannelProgressMedia => "CHANNEL_PROGRESS_MEDIA",
    ChannelOutgoing => "CHANNEL_OUTGOING",
    ChannelPark => "CHANNEL_PARK",
    ChannelUnpark => "CHANNEL_UNPARK",
    ChannelApplication => "CHANNEL_APPLICATION",
    ChannelOriginate => "CHANNEL_ORIGINATE",
    ChannelUuid => "CHANNEL_UUID",
    Api => "API",
    Log => "LOG",
    InboundChan => "INBOUND_CHAN",
    OutboundChan => "OUTBOUND_CHAN",
    Startup => "STARTUP",
    Shutdown => "SHUTDOWN",
    Publish => "PUBLISH",
    Unpublish => "UNPUBLISH",
    Talk => "TALK",
    Notalk => "NOTALK",
    SessionCrash => "SESSION_CRASH",
    ModuleLoad => "MODULE_LOAD",
    ModuleUnload => "MODULE_UNLOAD",
    Dtmf => "DTMF",
    Message => "MESSAGE",
    PresenceIn => "PRESENCE_IN",
    NotifyIn => "NOTIFY_IN",
    PresenceOut => "PRESENCE_OUT",
    PresenceProbe => "PRESENCE_PROBE",
    MessageWaiting => "MESSAGE_WAITING",
    MessageQuery => "MESSAGE_QUERY",
    Roster => "ROSTER",
    Codec => "CODEC",
    BackgroundJob => "BACKGROUND_JOB",
    DetectedSpeech => "DETECTED_SPEECH",
    DetectedTone => "DETECTED_TONE",
    PrivateCommand => "PRIVATE_COMMAND",
    Heartbeat => "HEARTBEAT",
    Trap => "TRAP",
    AddSchedule => "ADD_SCHEDULE",
    DelSchedule => "DEL_SCHEDULE",
    ExeSchedule => "EXE_SCHEDULE",
    ReSchedule => "RE_SCHEDULE",
    ReloadXml => "RELOADXML",
    Notify => "NOTIFY",
    PhoneFeature => "PHONE_FEATURE",
    PhoneFeatureSubscribe => "PHONE_FEATURE_SUBSCRIBE",
    SendMessage => "SEND_MESSAGE",
    RecvMessage => "RECV_MESSAGE",
    RequestParams => "REQUEST_PARAMS",
    ChannelData => "CHANNEL_DATA",
    General => "GENERAL",
    Command => "COMMAND",
    SessionHeartbeat => "SESSION_HEARTBEAT",
    ClientDisconnected => "CLIENT_DISCONNECTED",
    ServerDisconnected => "SERVER_DISCONNECTED",
    SendInfo => "SEND_INFO",
    RecvInfo => "RECV_INFO",
    RecvRtcpMessage => "RECV_RTCP_MESSAGE",
    SendRtcpMessage => "SEND_RTCP_MESSAGE",
    CallSecure => "CALL_SECURE",
    Nat => "NAT",
    RecordStart => "RECORD_START",
    RecordStop => "RECORD_STOP",
    PlaybackStart => "PLAYBACK_START",
    PlaybackStop => "PLAYBACK_STOP",
    CallUpdate => "CALL_UPDATE",
    Failure => "FAILURE",
    SocketData => "SOCKET_DATA",
    MediaBugStart => "MEDIA_BUG_START",
    MediaBugStop => "MEDIA_BUG_STOP",
    ConferenceDataQuery => "CONFERENCE_DATA_QUERY",
    ConferenceData => "CONFERENCE_DATA",
    CallSetupReq => "CALL_SETUP_REQ",
    CallSetupResult => "CALL_SETUP_RESULT",
    CallDetail => "CALL_DETAIL",
    DeviceState => "DEVICE_STATE",
    Text => "TEXT",
    ShutdownRequested => "SHUTDOWN_REQUESTED",
}

/// A parsed `text/event-plain` message.
///
/// The envelope body is itself a key/value block in ESL header syntax; this
/// type re-parses it and exposes the event headers plus any inner body that
/// follows the blank line (e.g. a `BACKGROUND_JOB` result).
///
/// Header values may be percent-encoded on the wire. [`header()`](Self::header)
/// returns them untouched; [`decoded_header()`](Self::decoded_header) decodes
/// on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    headers: Headers,
    body: Option<String>,
}

impl EventMessage {
    /// Parse an event from a framed `text/event-plain` message.
    pub fn from_message(message: EslMessage) -> EslResult<Self> {
        if message.content_type() != Some(ContentType::EventPlain) {
            return Err(EslError::protocol_error("not a text/event-plain message"));
        }
        let body = message
            .body()
            .ok_or_else(|| EslError::protocol_error("event message missing body"))?;

        // Event headers end at the first blank line; the remainder is the
        // inner body.
        let (header_section, inner_body) = match body.split_once("\n\n") {
            Some((headers, rest)) => (headers, rest),
            None => (body, ""),
        };

        let mut headers = Headers::new();
        for line in header_section.split('\n') {
            if line.is_empty() {
                continue;
            }
            if let Some((name, value)) = line.split_once(": ") {
                headers.insert(name, value);
            }
        }

        let body = if inner_body.is_empty() {
            None
        } else {
            Some(inner_body.to_string())
        };

        Ok(Self { headers, body })
    }

    /// The event name, with [`EventName::Unknown`] as the fallback.
    pub fn event_name(&self) -> EventName {
        self.header(EventHeader::EventName)
            .map(EventName::parse)
            .unwrap_or_else(|| EventName::Unknown(String::new()))
    }

    /// `Event-Subclass`, set on `CUSTOM` events.
    pub fn subclass(&self) -> Option<&str> {
        self.header(EventHeader::EventSubclass)
    }

    /// `Unique-ID`: the channel UUID, when the event concerns a channel.
    pub fn unique_id(&self) -> Option<&str> {
        self.header(EventHeader::UniqueId)
    }

    /// `Job-UUID`, set on `BACKGROUND_JOB` events.
    pub fn job_uuid(&self) -> Option<&str> {
        self.header(EventHeader::JobUuid)
    }

    /// `Application-UUID`, set on `CHANNEL_EXECUTE_COMPLETE` events. This is
    /// the `Event-UUID` the client supplied in `sendmsg`.
    pub fn application_uuid(&self) -> Option<&str> {
        self.header(EventHeader::ApplicationUuid)
    }

    /// `Application`: the dialplan application the event concerns.
    pub fn application(&self) -> Option<&str> {
        self.header(EventHeader::Application)
    }

    /// `Application-Data`: the arguments the application ran with.
    pub fn application_data(&self) -> Option<&str> {
        self.header(EventHeader::ApplicationData)
    }

    /// `Application-Response`: the application result text on
    /// execute-complete events.
    pub fn application_response(&self) -> Option<&str> {
        self.header(EventHeader::ApplicationResponse)
    }

    /// `Hangup-Cause` (e.g. `NORMAL_CLEARING`, `UNALLOCATED_NUMBER`).
    pub fn hangup_cause(&self) -> Option<&str> {
        self.header(EventHeader::HangupCause)
    }

    /// Look up an event header by name, raw (not percent-decoded).
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers.get(name)
    }

    /// Look up an event header and percent-decode its value. Values that are
    /// not valid percent-encoding are returned raw.
    pub fn decoded_header(&self, name: impl AsRef<str>) -> Option<Cow<'_, str>> {
        let raw = self.header(name)?;
        match percent_decode_str(raw).decode_utf8() {
            Ok(decoded) => Some(decoded),
            Err(_) => Some(Cow::Borrowed(raw)),
        }
    }

    /// All event headers in wire order.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The inner body following the event-header block, if any.
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }
}

/// Result of a background API command, derived from the `BACKGROUND_JOB`
/// event body: `+OK <payload>` or `-ERR <reason>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundJobResult {
    job_uuid: String,
    body: String,
}

impl BackgroundJobResult {
    /// Derive the result from a `BACKGROUND_JOB` event.
    pub fn from_event(event: &EventMessage) -> Self {
        Self {
            job_uuid: event.job_uuid().unwrap_or_default().to_string(),
            body: event
                .body()
                .unwrap_or_default()
                .trim_end_matches('\n')
                .to_string(),
        }
    }

    /// The `Job-UUID` correlating this result to its `bgapi` command.
    pub fn job_uuid(&self) -> &str {
        &self.job_uuid
    }

    /// `true` if the job body starts with `+OK`.
    pub fn success(&self) -> bool {
        self.body.starts_with("+OK")
    }

    /// The raw job body with trailing newlines removed.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Error text after the `-ERR ` prefix, if the job failed.
    pub fn error_message(&self) -> Option<&str> {
        self.body.strip_prefix("-ERR ")
    }
}
