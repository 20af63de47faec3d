//! Logical message frames and their wire framing.
//!
//! Every frame carries the headers `Path`, `X-RequestId`, `X-Timestamp` and
//! (for text frames) `Content-Type`. Text frames are serialized as CRLF
//! header lines, a blank line, then the UTF-8 body. Binary frames prefix the
//! header section with its length as a big-endian `u16`, followed by the raw
//! body. A binary frame on path `audio` with an empty body signals
//! end-of-audio to the service.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{SecondsFormat, Utc};

use crate::error::SessionError;

/// Outbound message path for the configuration handshake.
pub const PATH_SPEECH_CONFIG: &str = "speech.config";
/// Outbound message path for the per-turn context.
pub const PATH_SPEECH_CONTEXT: &str = "speech.context";
/// Outbound message path for telemetry flushes.
pub const PATH_TELEMETRY: &str = "telemetry";
/// Outbound message path for binary audio.
pub const PATH_AUDIO: &str = "audio";

pub const CONTENT_TYPE_JSON: &str = "application/json";

const HEADER_PATH: &str = "Path";
const HEADER_REQUEST_ID: &str = "X-RequestId";
const HEADER_TIMESTAMP: &str = "X-Timestamp";
const HEADER_CONTENT_TYPE: &str = "Content-Type";

/// Frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    Text(String),
    /// `None` (or an empty buffer) on path `audio` denotes end-of-audio.
    Binary(Option<Bytes>),
}

/// One framed message on the duplex channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub path: String,
    pub request_id: String,
    pub content_type: Option<String>,
    pub payload: MessagePayload,
}

impl RawMessage {
    /// A JSON text frame.
    pub fn text(path: &str, request_id: &str, body: String) -> Self {
        Self {
            path: path.to_string(),
            request_id: request_id.to_string(),
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            payload: MessagePayload::Text(body),
        }
    }

    /// A binary audio frame; `None` body marks end-of-audio.
    pub fn audio(request_id: &str, body: Option<Bytes>) -> Self {
        Self {
            path: PATH_AUDIO.to_string(),
            request_id: request_id.to_string(),
            content_type: None,
            payload: MessagePayload::Binary(body),
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self.payload, MessagePayload::Binary(_))
    }

    /// Whether this is the empty-bodied end-of-audio marker.
    pub fn is_audio_end(&self) -> bool {
        self.path.eq_ignore_ascii_case(PATH_AUDIO)
            && matches!(&self.payload, MessagePayload::Binary(b) if b.as_ref().is_none_or(|b| b.is_empty()))
    }

    /// Text body, if this is a text frame.
    pub fn text_body(&self) -> Option<&str> {
        match &self.payload {
            MessagePayload::Text(body) => Some(body),
            MessagePayload::Binary(_) => None,
        }
    }

    fn header_section(&self) -> String {
        let mut headers = format!(
            "{HEADER_PATH}: {}\r\n{HEADER_REQUEST_ID}: {}\r\n{HEADER_TIMESTAMP}: {}\r\n",
            self.path,
            self.request_id,
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        if let Some(content_type) = &self.content_type {
            headers.push_str(&format!("{HEADER_CONTENT_TYPE}: {content_type}\r\n"));
        }
        headers
    }

    /// Serialize a text frame to its wire form.
    pub fn encode_text(&self) -> Result<String, SessionError> {
        let MessagePayload::Text(body) = &self.payload else {
            return Err(SessionError::Runtime(
                "attempted to encode a binary frame as text".to_string(),
            ));
        };
        Ok(format!("{}\r\n{}", self.header_section(), body))
    }

    /// Serialize a binary frame to its wire form.
    pub fn encode_binary(&self) -> Result<Bytes, SessionError> {
        let MessagePayload::Binary(body) = &self.payload else {
            return Err(SessionError::Runtime(
                "attempted to encode a text frame as binary".to_string(),
            ));
        };
        let headers = self.header_section();
        let body = body.as_deref().unwrap_or_default();
        let mut frame = BytesMut::with_capacity(2 + headers.len() + body.len());
        frame.put_u16(headers.len() as u16);
        frame.put_slice(headers.as_bytes());
        frame.put_slice(body);
        Ok(frame.freeze())
    }

    /// Parse an inbound text frame.
    pub fn decode_text(raw: &str) -> Result<Self, SessionError> {
        let (headers, body) = raw.split_once("\r\n\r\n").ok_or_else(|| {
            SessionError::Transport("text frame missing header delimiter".to_string())
        })?;
        let (path, request_id, content_type) = parse_headers(headers)?;
        Ok(Self {
            path,
            request_id,
            content_type,
            payload: MessagePayload::Text(body.to_string()),
        })
    }

    /// Parse an inbound binary frame.
    pub fn decode_binary(raw: &[u8]) -> Result<Self, SessionError> {
        if raw.len() < 2 {
            return Err(SessionError::Transport(
                "binary frame shorter than its length prefix".to_string(),
            ));
        }
        let header_len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
        if raw.len() < 2 + header_len {
            return Err(SessionError::Transport(
                "binary frame header section truncated".to_string(),
            ));
        }
        let headers = std::str::from_utf8(&raw[2..2 + header_len])
            .map_err(|e| SessionError::Transport(format!("binary frame headers not UTF-8: {e}")))?;
        let (path, request_id, content_type) = parse_headers(headers)?;
        let body = &raw[2 + header_len..];
        Ok(Self {
            path,
            request_id,
            content_type,
            payload: MessagePayload::Binary((!body.is_empty()).then(|| Bytes::copy_from_slice(body))),
        })
    }
}

fn parse_headers(section: &str) -> Result<(String, String, Option<String>), SessionError> {
    let mut path = None;
    let mut request_id = None;
    let mut content_type = None;
    for line in section.split("\r\n").filter(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case(HEADER_PATH) {
            path = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(HEADER_REQUEST_ID) {
            request_id = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(HEADER_CONTENT_TYPE) {
            content_type = Some(value.to_string());
        }
    }
    let path =
        path.ok_or_else(|| SessionError::Transport("frame missing Path header".to_string()))?;
    // Some service frames (e.g. turn.start on older hosts) may omit the
    // request id; normalize to empty so the dispatcher's filter drops them.
    Ok((path, request_id.unwrap_or_default(), content_type))
}
