//! Error types for the ESL client

use thiserror::Error;

/// Result alias used throughout the crate.
pub type EslResult<T> = Result<T, EslError>;

/// Errors returned by the decoder, the connection and the client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EslError {
    /// Socket read/write failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket closed (EOF mid-frame, or while a command awaited its reply)
    #[error("connection closed")]
    ConnectionClosed,

    /// No authenticated session is available for sending
    #[error("Not connected to FreeSWITCH Event Socket")]
    NotConnected,

    /// Dial or command wait exceeded its deadline
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Frame header name outside the recognized set
    #[error("Unhandled ESL header [{header}]")]
    UnhandledHeader { header: String },

    /// Malformed header line or value (e.g. non-numeric Content-Length)
    #[error("invalid header: {header}")]
    InvalidHeader { header: String },

    /// Generic protocol violation
    #[error("protocol error: {message}")]
    ProtocolError { message: String },

    /// Content-Length above the accepted bound
    #[error("message too large: Content-Length {length} exceeds limit {limit}")]
    MessageTooLarge { length: usize, limit: usize },

    /// Event subscription requested with a format other than `plain`
    #[error("Only 'plain' event format is supported at present, got '{format}'")]
    UnsupportedEventFormat { format: String },

    /// `text/event-xml` frames cannot be parsed into events
    #[error("XML events are not yet supported")]
    XmlEventsUnsupported,

    /// A frame that cannot be viewed as an event
    #[error("Unexpected EVENT content-type: {content_type}")]
    UnexpectedContentType { content_type: String },

    /// Server rejected (or did not properly answer) the `auth` command
    #[error("Authentication failed: {reply_text}")]
    AuthenticationFailed { reply_text: String },

    /// Reply-Text started with `-ERR`
    #[error("command failed: {reply_text}")]
    CommandFailed { reply_text: String },

    /// Reply-Text matched neither `+OK` nor `-ERR`
    #[error("unexpected reply: {reply_text}")]
    UnexpectedReply { reply_text: String },

    /// A `bgapi` reply without a Job-UUID header
    #[error("Missing Job-UUID header in bgapi response")]
    MissingJobUuid,
}

impl EslError {
    pub(crate) fn protocol_error(message: impl Into<String>) -> Self {
        EslError::ProtocolError {
            message: message.into(),
        }
    }

    pub(crate) fn auth_failed(reply_text: impl Into<String>) -> Self {
        EslError::AuthenticationFailed {
            reply_text: reply_text.into(),
        }
    }

    /// Whether this error came from frame decoding (the byte stream is out of sync).
    pub fn is_framing_error(&self) -> bool {
        matches!(
            self,
            EslError::UnhandledHeader { .. }
                | EslError::InvalidHeader { .. }
                | EslError::MessageTooLarge { .. }
                | EslError::ProtocolError { .. }
        )
    }
}
