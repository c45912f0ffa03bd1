//! ESL event model: a message body re-parsed as its own header/body structure

use crate::{
    constants::EVENT_BACKGROUND_JOB,
    error::{EslError, EslResult},
    headers::EventHeader,
    protocol::{EslMessage, MessageHeaders, MessageType},
};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{trace, warn};

/// Event formats accepted by the `event` subscription command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EventFormat {
    /// Plain text format (the only one this client can parse)
    Plain,
    /// XML format
    Xml,
}

impl fmt::Display for EventFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFormat::Plain => write!(f, "plain"),
            EventFormat::Xml => write!(f, "xml"),
        }
    }
}

impl FromStr for EventFormat {
    type Err = ParseEventFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "xml" => Ok(Self::Xml),
            _ => Err(ParseEventFormatError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid event format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventFormatError(pub String);

impl fmt::Display for ParseEventFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event format: {}", self.0)
    }
}

impl std::error::Error for ParseEventFormatError {}

/// `true` if every `%` is followed by two hex digits.
fn escapes_well_formed(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while let Some(offset) = bytes[i..]
        .iter()
        .position(|&b| b == b'%')
    {
        let at = i + offset;
        match bytes.get(at + 1..at + 3) {
            Some(pair)
                if pair
                    .iter()
                    .all(u8::is_ascii_hexdigit) =>
            {
                i = at + 3
            }
            _ => return false,
        }
    }
    true
}

/// Percent-decode an event header value.
///
/// Values without a `%` are returned unchanged. A value with a malformed
/// escape, or one that decodes to invalid UTF-8, is kept raw and a warning
/// is logged; decoding never fails the event.
pub fn decode_header_value(raw: &str) -> Cow<'_, str> {
    if !raw.contains('%') {
        return Cow::Borrowed(raw);
    }
    if !escapes_well_formed(raw) {
        warn!("Could not URL decode {}", raw);
        return Cow::Borrowed(raw);
    }
    match percent_decode_str(raw).decode_utf8() {
        Ok(decoded) => {
            trace!("decoded from: {} to: {}", raw, decoded);
            Cow::Owned(decoded.into_owned())
        }
        Err(_) => {
            warn!("Could not URL decode {}", raw);
            Cow::Borrowed(raw)
        }
    }
}

/// A server-pushed event, parsed from an [`EslMessage`] body.
///
/// Body lines up to and including the event's own `Content-Length` line are
/// `name: value` headers; every line after it is free-text event body.
#[derive(Debug, Clone, Serialize)]
pub struct EslEvent {
    message_headers: Arc<MessageHeaders>,
    event_headers: HashMap<String, String>,
    event_body: Vec<String>,
}

impl EslEvent {
    /// Parse an event out of a `text/event-plain` (or `command/reply`) message.
    ///
    /// `text/event-xml` is rejected with [`EslError::XmlEventsUnsupported`];
    /// any other content type with [`EslError::UnexpectedContentType`].
    pub fn from_message(message: &EslMessage) -> EslResult<Self> {
        match message.message_type() {
            MessageType::EventPlain | MessageType::CommandReply => {}
            MessageType::EventXml => return Err(EslError::XmlEventsUnsupported),
            _ => {
                return Err(EslError::UnexpectedContentType {
                    content_type: message
                        .content_type()
                        .unwrap_or("")
                        .to_string(),
                })
            }
        }

        let body = message.body_lines();
        let mut event = EslEvent {
            message_headers: message.shared_headers(),
            event_headers: HashMap::with_capacity(body.len()),
            event_body: Vec::new(),
        };

        let mut in_body = false;
        for line in body {
            if in_body {
                if !line.is_empty() {
                    event
                        .event_body
                        .push(line.clone());
                }
                continue;
            }

            let Some((name, value)) = line.split_once(':') else {
                warn!("Ignoring malformed event header line [{}]", line);
                continue;
            };
            let name = name.trim();
            let value = decode_header_value(value.trim());
            event
                .event_headers
                .insert(name.to_string(), value.into_owned());

            if name == EventHeader::ContentLength.as_str() {
                in_body = true;
            }
        }

        Ok(event)
    }

    /// Headers of the frame that carried this event.
    pub fn message_headers(&self) -> &MessageHeaders {
        &self.message_headers
    }

    /// Look up an event header by name (case-sensitive).
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.event_headers
            .get(name.as_ref())
            .map(|s| s.as_str())
    }

    /// All event headers.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.event_headers
    }

    /// Event body lines, after the event's `Content-Length` marker.
    pub fn body_lines(&self) -> &[String] {
        &self.event_body
    }

    /// `true` if the event carried any body lines.
    pub fn has_event_body(&self) -> bool {
        !self
            .event_body
            .is_empty()
    }

    fn header_or_empty(&self, name: EventHeader) -> &str {
        self.header(name)
            .unwrap_or("")
    }

    /// `Event-Name`, or the empty string when absent.
    pub fn event_name(&self) -> &str {
        self.header_or_empty(EventHeader::EventName)
    }

    /// `Event-Date-Timestamp` (microseconds since the epoch, as sent).
    pub fn event_date_timestamp(&self) -> &str {
        self.header_or_empty(EventHeader::EventDateTimestamp)
    }

    /// `Event-Date-Local`
    pub fn event_date_local(&self) -> &str {
        self.header_or_empty(EventHeader::EventDateLocal)
    }

    /// `Event-Date-GMT`
    pub fn event_date_gmt(&self) -> &str {
        self.header_or_empty(EventHeader::EventDateGmt)
    }

    /// `Job-UUID` of a `BACKGROUND_JOB` event, for correlating with
    /// [`EslClient::send_async_api_command`](crate::EslClient::send_async_api_command).
    pub fn job_uuid(&self) -> Option<&str> {
        self.header(EventHeader::JobUuid)
    }

    /// `true` for `BACKGROUND_JOB` events.
    pub fn is_background_job(&self) -> bool {
        self.event_name() == EVENT_BACKGROUND_JOB
    }
}

impl fmt::Display for EslEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EslEvent: name=[{}] headers={}, eventHeaders={}, eventBody={} lines.",
            self.event_name(),
            self.message_headers
                .len(),
            self.event_headers
                .len(),
            self.event_body
                .len()
        )
    }
}
