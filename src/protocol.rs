//! ESL frame decoding and the decoded message model

use crate::{
    constants::{
        CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_AUTH_REQUEST, CONTENT_TYPE_COMMAND_REPLY,
        CONTENT_TYPE_DISCONNECT_NOTICE, CONTENT_TYPE_RUDE_REJECTION,
        CONTENT_TYPE_TEXT_EVENT_PLAIN, CONTENT_TYPE_TEXT_EVENT_XML, LINE_TERMINATOR,
        MAX_MESSAGE_SIZE, NEW_LINE,
    },
    error::{EslError, EslResult},
    headers::MessageHeader,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::trace;

/// Frame headers keyed by the closed [`MessageHeader`] set.
pub type MessageHeaders = HashMap<MessageHeader, String>;

/// ESL message types, classified from the `Content-Type` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    /// Authentication request from server
    AuthRequest,
    /// API response
    ApiResponse,
    /// Command reply
    CommandReply,
    /// Plain-text event
    EventPlain,
    /// XML event (recognized, not parseable)
    EventXml,
    /// Disconnect notice
    DisconnectNotice,
    /// Server refused the connection (e.g. ACL)
    RudeRejection,
    /// Unknown message type
    Unknown(String),
}

impl MessageType {
    /// Parse message type from Content-Type header
    pub fn from_content_type(content_type: &str) -> Self {
        match content_type {
            CONTENT_TYPE_AUTH_REQUEST => MessageType::AuthRequest,
            CONTENT_TYPE_API_RESPONSE => MessageType::ApiResponse,
            CONTENT_TYPE_COMMAND_REPLY => MessageType::CommandReply,
            CONTENT_TYPE_TEXT_EVENT_PLAIN => MessageType::EventPlain,
            CONTENT_TYPE_TEXT_EVENT_XML => MessageType::EventXml,
            CONTENT_TYPE_DISCONNECT_NOTICE => MessageType::DisconnectNotice,
            CONTENT_TYPE_RUDE_REJECTION => MessageType::RudeRejection,
            _ => MessageType::Unknown(content_type.to_string()),
        }
    }
}

/// One decoded ESL frame: header block plus optional body lines.
///
/// Header values are kept behind an `Arc` so events derived from this
/// message can refer to them without copying.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EslMessage {
    headers: Arc<MessageHeaders>,
    body: Vec<String>,
    content_length: usize,
}

impl EslMessage {
    /// Build a message from already-parsed parts. Empty body lines are dropped.
    pub fn new<I, S>(headers: MessageHeaders, body_lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let content_length = headers
            .get(&MessageHeader::ContentLength)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut message = Self {
            headers: Arc::new(headers),
            body: Vec::new(),
            content_length,
        };
        for line in body_lines {
            message.add_body_line(line.as_ref());
        }
        message
    }

    /// All frame headers.
    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub(crate) fn shared_headers(&self) -> Arc<MessageHeaders> {
        Arc::clone(&self.headers)
    }

    /// Look up a frame header.
    pub fn header(&self, name: MessageHeader) -> Option<&str> {
        self.headers
            .get(&name)
            .map(|s| s.as_str())
    }

    /// `true` if the header exists with a non-empty value.
    pub fn has_header(&self, name: MessageHeader) -> bool {
        self.header(name)
            .is_some_and(|v| !v.is_empty())
    }

    /// `Content-Type` header value.
    pub fn content_type(&self) -> Option<&str> {
        self.header(MessageHeader::ContentType)
    }

    /// Classification of the `Content-Type` header.
    pub fn message_type(&self) -> MessageType {
        MessageType::from_content_type(
            self.content_type()
                .unwrap_or(""),
        )
    }

    /// `true` if the frame carried a `Content-Length` header.
    pub fn has_content_length(&self) -> bool {
        self.has_header(MessageHeader::ContentLength)
    }

    /// Number of body bytes consumed from the stream for this frame.
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Non-empty body lines, in wire order.
    pub fn body_lines(&self) -> &[String] {
        &self.body
    }

    /// `Reply-Text` header value.
    pub fn reply_text(&self) -> Option<&str> {
        self.header(MessageHeader::ReplyText)
    }

    /// `Job-UUID` header value.
    pub fn job_uuid(&self) -> Option<&str> {
        self.header(MessageHeader::JobUuid)
    }

    fn add_body_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        self.body
            .push(line.to_string());
    }
}

impl fmt::Display for EslMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EslMessage: contentType=[{}] headers={} body={} lines.",
            self.content_type()
                .unwrap_or(""),
            self.headers
                .len(),
            self.body
                .len()
        )
    }
}

/// Read one `\n`-terminated line into `buf`, without the terminator.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> EslResult<()>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = reader
        .read_until(NEW_LINE, buf)
        .await?;
    if n == 0 || buf.last() != Some(&NEW_LINE) {
        return Err(EslError::ConnectionClosed);
    }
    buf.pop();
    Ok(())
}

/// Split a header line on its first colon and resolve the name.
fn parse_header_line(line: &str) -> EslResult<(MessageHeader, String)> {
    let (name, value) = match line.split_once(':') {
        Some((name, value)) => (name, Some(value)),
        None => (line, None),
    };
    let header = name
        .parse::<MessageHeader>()
        .map_err(|_| EslError::UnhandledHeader {
            header: name.to_string(),
        })?;
    let value = value.ok_or_else(|| EslError::InvalidHeader {
        header: line.to_string(),
    })?;
    Ok((
        header,
        value
            .trim()
            .to_string(),
    ))
}

/// Decode exactly one frame from the stream.
///
/// Header lines are read until an empty line (`\n\n`). If a `Content-Length`
/// header is present, exactly that many body bytes are then read and split
/// into lines. Any read failure, unknown header name, or malformed
/// `Content-Length` aborts the decode; the stream is out of sync afterwards.
pub async fn decode<R>(reader: &mut R) -> EslResult<EslMessage>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = MessageHeaders::new();
    let mut line = Vec::new();

    loop {
        read_line(reader, &mut line).await?;
        if line.is_empty() {
            break;
        }
        let header_line = std::str::from_utf8(&line)
            .map_err(|_| EslError::protocol_error("Invalid UTF-8 in headers"))?;
        trace!("[RECV] header line {}", header_line);
        let (name, value) = parse_header_line(header_line)?;
        headers.insert(name, value);
    }

    let length = match headers
        .get(&MessageHeader::ContentLength)
        .filter(|v| !v.is_empty())
    {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| EslError::InvalidHeader {
                header: format!("Content-Length: {}", raw),
            })?,
        None => return Ok(EslMessage::new(headers, std::iter::empty::<&str>())),
    };

    if length > MAX_MESSAGE_SIZE {
        return Err(EslError::MessageTooLarge {
            length,
            limit: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; length];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => EslError::ConnectionClosed,
            _ => EslError::Io(e),
        })?;
    trace!("[RECV] read {} body bytes", length);

    let body = String::from_utf8(body)
        .map_err(|_| EslError::protocol_error("Invalid UTF-8 in body"))?;

    Ok(EslMessage::new(headers, body.split(LINE_TERMINATOR)))
}
