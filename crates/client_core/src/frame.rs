//! Codec for the STOMP-lite frames exchanged over the socket.
//!
//! ```text
//! COMMAND\n
//! key:value\n      (zero or more, order preserved)
//! \n
//! body bytes       (optional)
//! \0
//! ```
//!
//! The NUL byte is the only frame boundary, so it may not occur in a body or
//! header.

use shared::domain::DeviceType;
use thiserror::Error;

pub const TERMINATOR: u8 = 0x00;
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Send,
    Subscribe,
    /// Server push delivered to a subscription.
    Message,
    /// Server-side protocol error report.
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Message => "MESSAGE",
            Self::Error => "ERROR",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SEND" => Some(Self::Send),
            "SUBSCRIBE" => Some(Self::Subscribe),
            "MESSAGE" => Some(Self::Message),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame body contains an embedded terminator byte at offset {offset}")]
    EmbeddedTerminator { offset: usize },
    #[error("invalid header {key:?}: {reason}")]
    InvalidHeader { key: String, reason: &'static str },
    #[error("frame is empty")]
    Empty,
    #[error("frame is not terminated by a NUL byte")]
    MissingTerminator,
    #[error("unknown frame command {0:?}")]
    UnknownCommand(String),
    #[error("frame header section is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed header line {0:?}")]
    MalformedHeaderLine(String),
    #[error("frame ends before the blank line that closes the headers")]
    UnterminatedHeaders,
    #[error("content-length {declared} exceeds the {available} body bytes present")]
    ContentLengthMismatch { declared: usize, available: usize },
    #[error("content-length {0:?} is not a number")]
    InvalidContentLength(String),
    #[error("unexpected data at offset {offset} after the frame terminator")]
    TrailingData { offset: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// First value for `key`, in header order.
    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn destination(&self) -> Option<&str> {
        self.header_value("destination")
    }

    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_deref().unwrap_or_default()
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let body = self.body_bytes();
        if let Some(offset) = body.iter().position(|byte| *byte == TERMINATOR) {
            return Err(FrameError::EmbeddedTerminator { offset });
        }

        let mut out = Vec::with_capacity(64 + body.len());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');
        for (key, value) in &self.headers {
            validate_header(key, value)?;
            out.extend_from_slice(key.as_bytes());
            out.push(b':');
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(body);
        out.push(TERMINATOR);
        Ok(out)
    }

    /// Decodes exactly one frame. Only EOLs may follow its terminator.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (frame, rest) = Self::decode_prefix(bytes)?;
        if let Some(extra) = rest.iter().position(|byte| !is_eol(*byte)) {
            return Err(FrameError::TrailingData {
                offset: bytes.len() - rest.len() + extra,
            });
        }
        Ok(frame)
    }

    /// Decodes every frame in a buffer that may carry several back to back.
    /// Decoding stops at the first malformed frame.
    pub fn decode_all(bytes: &[u8]) -> Vec<Result<Self, FrameError>> {
        let mut frames = Vec::new();
        let mut rest = bytes;
        while rest.iter().any(|byte| !is_eol(*byte)) {
            match Self::decode_prefix(rest) {
                Ok((frame, remaining)) => {
                    frames.push(Ok(frame));
                    rest = remaining;
                }
                Err(err) => {
                    frames.push(Err(err));
                    break;
                }
            }
        }
        frames
    }

    /// Decodes the first frame and returns the bytes after its terminator.
    /// The first NUL is always the frame boundary.
    pub fn decode_prefix(bytes: &[u8]) -> Result<(Self, &[u8]), FrameError> {
        // Servers may send bare EOLs between frames as their own heartbeat.
        let start = bytes
            .iter()
            .position(|byte| !is_eol(*byte))
            .ok_or(FrameError::Empty)?;
        let bytes = &bytes[start..];
        let terminator = bytes
            .iter()
            .position(|byte| *byte == TERMINATOR)
            .ok_or(FrameError::MissingTerminator)?;
        let frame = &bytes[..terminator];
        let rest = &bytes[terminator + 1..];

        let header_end = find_header_end(frame).ok_or(FrameError::UnterminatedHeaders)?;
        let head =
            std::str::from_utf8(&frame[..header_end.head_len]).map_err(|_| FrameError::InvalidUtf8)?;
        let mut lines = head.split('\n').map(|line| line.trim_end_matches('\r'));

        let command_line = lines.next().ok_or(FrameError::Empty)?;
        let command = Command::parse(command_line)
            .ok_or_else(|| FrameError::UnknownCommand(command_line.to_string()))?;

        let mut headers = Vec::new();
        for line in lines {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeaderLine(line.to_string()))?;
            headers.push((key.to_string(), value.to_string()));
        }

        let mut body = &frame[header_end.body_start..];
        if let Some((_, raw)) = headers.iter().find(|(key, _)| key == "content-length") {
            let declared: usize = raw
                .trim()
                .parse()
                .map_err(|_| FrameError::InvalidContentLength(raw.clone()))?;
            if declared > body.len() {
                return Err(FrameError::ContentLengthMismatch {
                    declared,
                    available: body.len(),
                });
            }
            body = &body[..declared];
        }

        let frame = Self {
            command,
            headers,
            body: (!body.is_empty()).then(|| body.to_vec()),
        };
        Ok((frame, rest))
    }
}

fn is_eol(byte: u8) -> bool {
    matches!(byte, b'\n' | b'\r')
}

struct HeaderEnd {
    head_len: usize,
    body_start: usize,
}

fn find_header_end(frame: &[u8]) -> Option<HeaderEnd> {
    let mut index = 0;
    while index < frame.len() {
        if frame[index] == b'\n' {
            let rest = &frame[index + 1..];
            if rest.first() == Some(&b'\n') {
                return Some(HeaderEnd {
                    head_len: index,
                    body_start: index + 2,
                });
            }
            if rest.starts_with(b"\r\n") {
                return Some(HeaderEnd {
                    head_len: index,
                    body_start: index + 3,
                });
            }
        }
        index += 1;
    }
    // A command line with no headers and no body: "SUBSCRIBE\n\n" trimmed to "SUBSCRIBE\n".
    if frame.last() == Some(&b'\n') {
        let head_len = frame.len() - 1;
        return Some(HeaderEnd {
            head_len,
            body_start: frame.len(),
        });
    }
    None
}

fn validate_header(key: &str, value: &str) -> Result<(), FrameError> {
    let invalid = |reason| FrameError::InvalidHeader {
        key: key.to_string(),
        reason,
    };
    if key.is_empty() {
        return Err(invalid("empty key"));
    }
    if key.contains(':') {
        return Err(invalid("key contains ':'"));
    }
    if [key, value]
        .iter()
        .any(|part| part.contains(['\n', '\r', '\0']))
    {
        return Err(invalid("contains a line break or NUL"));
    }
    Ok(())
}

pub fn encode_send(
    destination: &str,
    body: &[u8],
    device_type: DeviceType,
    device_id: &str,
) -> Result<Vec<u8>, FrameError> {
    Frame::new(Command::Send)
        .header("destination", destination)
        .header("device-id", device_id)
        .header("device-type", device_type.as_str())
        .header("content-length", body.len().to_string())
        .header("content-type", JSON_CONTENT_TYPE)
        .with_body(body)
        .encode()
}

pub fn encode_subscribe(
    destination: &str,
    subscription_id: &str,
    device_type: DeviceType,
) -> Result<Vec<u8>, FrameError> {
    Frame::new(Command::Subscribe)
        .header("destination", destination)
        .header("id", subscription_id)
        .header("device-type", device_type.as_str())
        .encode()
}

/// Destination header of a raw frame, without fully decoding it.
pub fn decode_destination(text: &str) -> Option<String> {
    text.trim_start_matches(['\n', '\r'])
        .split('\n')
        .skip(1)
        .map(|line| line.trim_end_matches('\r'))
        .take_while(|line| !line.is_empty())
        .find_map(|line| line.strip_prefix("destination:"))
        .map(|value| value.trim().to_string())
}

#[cfg(test)]
#[path = "tests/frame_tests.rs"]
mod tests;
