//! Single-line command rendering and command reply handling

use crate::{
    constants::{REPLY_ERR, REPLY_OK},
    error::{EslError, EslResult},
    event::EventFormat,
    protocol::EslMessage,
};
use std::fmt;

/// Validate that a user-provided string contains no newline characters.
///
/// ESL commands are line-delimited; embedded newlines would allow injection
/// of arbitrary protocol commands.
pub(crate) fn validate_no_newlines(s: &str, context: &str) -> EslResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(EslError::protocol_error(format!(
            "{} must not contain newlines",
            context
        )));
    }
    Ok(())
}

/// Reply-Text classification per the ESL wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplyStatus {
    /// Reply-Text starts with `+OK`.
    Ok,
    /// Reply-Text starts with `-ERR`.
    Err,
    /// Reply-Text absent or matching neither prefix.
    Other,
}

impl ReplyStatus {
    /// Classify a `Reply-Text` value.
    pub fn from_reply_text(reply_text: &str) -> Self {
        if reply_text.starts_with(REPLY_OK) {
            ReplyStatus::Ok
        } else if reply_text.starts_with(REPLY_ERR) {
            ReplyStatus::Err
        } else {
            ReplyStatus::Other
        }
    }
}

/// The server's reply to a command, together with the command that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    command: String,
    reply_text: String,
    response: EslMessage,
    status: ReplyStatus,
}

impl CommandResponse {
    pub fn new(command: impl Into<String>, response: EslMessage) -> Self {
        let reply_text = response
            .reply_text()
            .unwrap_or("")
            .to_string();
        let status = ReplyStatus::from_reply_text(&reply_text);
        Self {
            command: command.into(),
            reply_text,
            response,
            status,
        }
    }

    /// The command as sent (first line for multi-line commands).
    pub fn command(&self) -> &str {
        &self.command
    }

    /// `true` if and only if the `Reply-Text` starts with `+OK`.
    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    pub fn status(&self) -> ReplyStatus {
        self.status
    }

    /// The full `Reply-Text` line, empty when absent.
    pub fn reply_text(&self) -> &str {
        &self.reply_text
    }

    /// The full reply message.
    pub fn response(&self) -> &EslMessage {
        &self.response
    }

    /// Convert to a result based on the reply status.
    pub fn into_result(self) -> EslResult<Self> {
        match self.status {
            ReplyStatus::Ok => Ok(self),
            ReplyStatus::Err => Err(EslError::CommandFailed {
                reply_text: self.reply_text,
            }),
            ReplyStatus::Other => Err(EslError::UnexpectedReply {
                reply_text: self.reply_text,
            }),
        }
    }
}

impl fmt::Display for CommandResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.command, self.reply_text)
    }
}

/// Single-line ESL commands issued by the client
#[derive(Clone)]
pub(crate) enum EslCommand {
    /// Answer the server's auth challenge
    Auth { password: String },
    /// Blocking API command
    Api { command: String },
    /// Background API command, answered later by a `BACKGROUND_JOB` event
    BgApi { command: String },
    /// Subscribe to events
    Events { format: EventFormat, events: String },
    /// Unsubscribe from all events
    NoEvents,
    /// Add an event filter
    Filter { header: String, value: String },
    /// Remove event filters
    FilterDelete {
        header: String,
        value: Option<String>,
    },
    /// Enable log forwarding at the given level
    Log { level: String },
    /// Disable log forwarding
    NoLog,
    /// End the session
    Exit,
}

impl fmt::Debug for EslCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EslCommand::Auth { .. } => f
                .debug_struct("Auth")
                .field("password", &"[REDACTED]")
                .finish(),
            EslCommand::Api { command } => f
                .debug_struct("Api")
                .field("command", command)
                .finish(),
            EslCommand::BgApi { command } => f
                .debug_struct("BgApi")
                .field("command", command)
                .finish(),
            EslCommand::Events { format, events } => f
                .debug_struct("Events")
                .field("format", format)
                .field("events", events)
                .finish(),
            EslCommand::NoEvents => write!(f, "NoEvents"),
            EslCommand::Filter { header, value } => f
                .debug_struct("Filter")
                .field("header", header)
                .field("value", value)
                .finish(),
            EslCommand::FilterDelete { header, value } => f
                .debug_struct("FilterDelete")
                .field("header", header)
                .field("value", value)
                .finish(),
            EslCommand::Log { level } => f
                .debug_struct("Log")
                .field("level", level)
                .finish(),
            EslCommand::NoLog => write!(f, "NoLog"),
            EslCommand::Exit => write!(f, "Exit"),
        }
    }
}

/// Log-safe rendering: identical to the wire line except for `auth`.
impl fmt::Display for EslCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EslCommand::Auth { .. } => write!(f, "auth [REDACTED]"),
            other => f.write_str(&other.render()),
        }
    }
}

impl EslCommand {
    fn render(&self) -> String {
        match self {
            EslCommand::Auth { password } => format!("auth {}", password),
            EslCommand::Api { command } => format!("api {}", command),
            EslCommand::BgApi { command } => format!("bgapi {}", command),
            EslCommand::Events { format, events } => format!("event {} {}", format, events),
            EslCommand::NoEvents => "noevents".to_string(),
            EslCommand::Filter { header, value } => format!("filter {} {}", header, value),
            EslCommand::FilterDelete {
                header,
                value: Some(value),
            } => format!("filter delete {} {}", header, value),
            EslCommand::FilterDelete {
                header,
                value: None,
            } => format!("filter delete {}", header),
            EslCommand::Log { level } => format!("log {}", level),
            EslCommand::NoLog => "nolog".to_string(),
            EslCommand::Exit => "exit".to_string(),
        }
    }

    /// Validate user-supplied fields, then render the command line without
    /// its terminator.
    pub(crate) fn wire_line(&self) -> EslResult<String> {
        match self {
            EslCommand::Auth { password } => validate_no_newlines(password, "password")?,
            EslCommand::Api { command } | EslCommand::BgApi { command } => {
                validate_no_newlines(command, "command")?
            }
            EslCommand::Events { events, .. } => validate_no_newlines(events, "event list")?,
            EslCommand::Filter { header, value } => {
                validate_no_newlines(header, "filter header")?;
                validate_no_newlines(value, "filter value")?;
            }
            EslCommand::FilterDelete { header, value } => {
                validate_no_newlines(header, "filter header")?;
                if let Some(value) = value {
                    validate_no_newlines(value, "filter value")?;
                }
            }
            EslCommand::Log { level } => validate_no_newlines(level, "log level")?,
            EslCommand::NoEvents | EslCommand::NoLog | EslCommand::Exit => {}
        }
        Ok(self.render())
    }
}
