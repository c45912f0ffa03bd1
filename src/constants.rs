//! Protocol constants and configuration defaults

/// Default FreeSWITCH ESL port for inbound connections
pub const DEFAULT_ESL_PORT: u16 = 8021;

/// Line delimiter byte used by every ESL read
pub const NEW_LINE: u8 = b'\n';

/// Protocol message terminators
pub const MESSAGE_TERMINATOR: &str = "\n\n";
pub const LINE_TERMINATOR: &str = "\n";

/// Maximum single message size (8MB) - validates Content-Length header
/// No legitimate ESL message should exceed this (largest is sofia status ~1-2MB)
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Content-Type header values
pub const CONTENT_TYPE_AUTH_REQUEST: &str = "auth/request";
pub const CONTENT_TYPE_API_RESPONSE: &str = "api/response";
pub const CONTENT_TYPE_COMMAND_REPLY: &str = "command/reply";
pub const CONTENT_TYPE_TEXT_EVENT_PLAIN: &str = "text/event-plain";
pub const CONTENT_TYPE_TEXT_EVENT_XML: &str = "text/event-xml";
pub const CONTENT_TYPE_DISCONNECT_NOTICE: &str = "text/disconnect-notice";
pub const CONTENT_TYPE_RUDE_REJECTION: &str = "text/rude-rejection";

/// Reply-Text prefixes
pub const REPLY_OK: &str = "+OK";
pub const REPLY_ERR: &str = "-ERR";

/// Event name carrying the result of a `bgapi` job
pub const EVENT_BACKGROUND_JOB: &str = "BACKGROUND_JOB";

/// Delay before a reconnect attempt, in seconds
pub const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 5;

/// Maximum number of listener notifications running at once
pub const DEFAULT_LISTENER_CONCURRENCY: usize = 64;
