//! Typed header names: the closed set of frame headers, and well-known event headers.

/// Error returned when a frame header name is outside the recognized set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMessageHeaderError(pub String);

impl std::fmt::Display for ParseMessageHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unhandled ESL header [{}]", self.0)
    }
}

impl std::error::Error for ParseMessageHeaderError {}

define_header_enum! {
    error_type: ParseMessageHeaderError,
    /// Header names that may appear in an ESL frame's header block.
    ///
    /// The vocabulary is closed: any other name in a frame header block is a
    /// decode error. Event payload headers (`Event-Name`, `Unique-ID`, ...) live
    /// in the frame *body* and are plain strings, see [`EventHeader`].
    pub enum MessageHeader {
        ContentType => "Content-Type",
        ContentLength => "Content-Length",
        ReplyText => "Reply-Text",
        JobUuid => "Job-UUID",
        SocketMode => "Socket-Mode",
        Control => "CONTROL",
    }
}

/// Error returned when parsing an unrecognized event header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventHeaderError(pub String);

impl std::fmt::Display for ParseEventHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown event header: {}", self.0)
    }
}

impl std::error::Error for ParseEventHeaderError {}

define_header_enum! {
    error_type: ParseEventHeaderError,
    /// Well-known event header names, for typed lookups with
    /// [`EslEvent::header()`](crate::EslEvent::header).
    ///
    /// Events may carry any header name; this list only covers the ones the
    /// client itself reads.
    pub enum EventHeader {
        EventName => "Event-Name",
        EventSubclass => "Event-Subclass",
        EventDateTimestamp => "Event-Date-Timestamp",
        EventDateLocal => "Event-Date-Local",
        EventDateGmt => "Event-Date-GMT",
        JobUuid => "Job-UUID",
        JobCommand => "Job-Command",
        UniqueId => "Unique-ID",
        CoreUuid => "Core-UUID",
        ContentLength => "Content-Length",
    }
}
