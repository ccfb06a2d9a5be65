//! Client protocol frames and wire codecs.
//!
//! Two encodings are negotiated at handshake:
//! - JSON text frames (self-describing, the default), and
//! - a compact binary framing: magic + protocol version + frame kind,
//!   then tagged length-prefixed fields, then a CRC32 trailer.
//!
//! Both encodings carry the same field names and values, so a client can
//! decode diffs against a baseline obtained in the same encoding.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Magic bytes for binary frames: 0xDEC0 ("deck").
pub const WIRE_MAGIC: u16 = 0xDEC0;

/// Current binary protocol version.
pub const WIRE_VERSION: u8 = 1;

// Frame kind bytes. Server frames are 0x0x, client frames 0x1x.
const KIND_SUBSCRIBED: u8 = 0x01;
const KIND_STATE_UPDATE: u8 = 0x02;
const KIND_DIFF_UPDATE: u8 = 0x03;
const KIND_PONG: u8 = 0x04;
const KIND_ERROR: u8 = 0x05;
const KIND_SHUTTING_DOWN: u8 = 0x06;
const KIND_SUBSCRIBE: u8 = 0x11;
const KIND_UNSUBSCRIBE: u8 = 0x12;
const KIND_PING: u8 = 0x13;

// Field tags inside a binary frame.
const TAG_VERSION: u8 = 0x01; // u64 LE
const TAG_TIMESTAMP: u8 = 0x02; // utf-8 ISO-8601
const TAG_BODY: u8 = 0x03; // JSON bytes

/// Wire encoding negotiated per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Json,
    Binary,
}

impl Encoding {
    pub fn from_query(value: Option<&str>) -> Option<Self> {
        match value {
            None | Some("json") => Some(Encoding::Json),
            Some("binary") => Some(Encoding::Binary),
            Some(_) => None,
        }
    }
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Subscribe { subscriptions: Vec<String> },
    Unsubscribe { subscriptions: Vec<String> },
    Ping,
}

/// Why a client payload did not parse into a `ClientMessage`.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientParseError {
    /// Valid JSON, but `action` is missing or unrecognised.
    UnknownAction(String),
    /// Not a JSON object at all.
    Malformed,
}

/// Parse a client text frame. `action` dispatches; anything unrecognised is
/// reported so the session can answer `error{code:"unknown_action"}`.
pub fn parse_client_text(text: &str) -> Result<ClientMessage, ClientParseError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ClientParseError::Malformed)?;
    let action = value
        .get("action")
        .and_then(|a| a.as_str())
        .unwrap_or("")
        .to_string();

    let subscriptions = || -> Vec<String> {
        value
            .get("subscriptions")
            .and_then(|s| s.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    match action.as_str() {
        "subscribe" => Ok(ClientMessage::Subscribe {
            subscriptions: subscriptions(),
        }),
        "unsubscribe" => Ok(ClientMessage::Unsubscribe {
            subscriptions: subscriptions(),
        }),
        "ping" => Ok(ClientMessage::Ping),
        _ => Err(ClientParseError::UnknownAction(action)),
    }
}

/// Frames the server sends. Field names are the wire contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed {
        subscriptions: Vec<String>,
        version: u64,
    },
    StateUpdate {
        version: u64,
        timestamp: String,
        data: Map<String, Value>,
    },
    DiffUpdate {
        version: u64,
        timestamp: String,
        changes: Map<String, Value>,
    },
    Pong,
    Error {
        code: String,
        message: String,
    },
    ShuttingDown,
}

impl ServerFrame {
    pub fn unknown_action(action: &str) -> Self {
        ServerFrame::Error {
            code: "unknown_action".to_string(),
            message: format!("unrecognised action {action:?}"),
        }
    }

    /// Whether this frame carries state (vs. control traffic).
    pub fn is_state(&self) -> bool {
        matches!(
            self,
            ServerFrame::StateUpdate { .. } | ServerFrame::DiffUpdate { .. }
        )
    }
}

/// Errors during binary frame parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum WireError {
    Truncated,
    InvalidMagic(u16),
    UnsupportedVersion(u8),
    UnknownFrameKind(u8),
    ChecksumMismatch,
    BadField(u8),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "frame truncated"),
            Self::InvalidMagic(m) => {
                write!(f, "invalid magic: 0x{m:04X} (expected 0x{WIRE_MAGIC:04X})")
            }
            Self::UnsupportedVersion(v) => {
                write!(f, "unsupported version: {v} (expected {WIRE_VERSION})")
            }
            Self::UnknownFrameKind(k) => write!(f, "unknown frame kind: 0x{k:02X}"),
            Self::ChecksumMismatch => write!(f, "checksum mismatch"),
            Self::BadField(t) => write!(f, "malformed field 0x{t:02X}"),
        }
    }
}

impl std::error::Error for WireError {}

struct FrameBuilder {
    buf: Vec<u8>,
}

impl FrameBuilder {
    fn new(kind: u8) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&WIRE_MAGIC.to_le_bytes());
        buf.push(WIRE_VERSION);
        buf.push(kind);
        Self { buf }
    }

    fn field(mut self, tag: u8, bytes: &[u8]) -> Self {
        self.buf.push(tag);
        self.buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(bytes);
        self
    }

    fn version(self, version: u64) -> Self {
        self.field(TAG_VERSION, &version.to_le_bytes())
    }

    fn timestamp(self, ts: &str) -> Self {
        self.field(TAG_TIMESTAMP, ts.as_bytes())
    }

    fn body(self, value: &Value) -> Self {
        let bytes = serde_json::to_vec(value).unwrap_or_default();
        self.field(TAG_BODY, &bytes)
    }

    fn finish(mut self) -> Vec<u8> {
        let crc = crc32(&self.buf);
        self.buf.extend_from_slice(&crc.to_le_bytes());
        self.buf
    }
}

/// Encode a server frame into the compact binary framing.
pub fn encode_binary(frame: &ServerFrame) -> Vec<u8> {
    match frame {
        ServerFrame::Subscribed {
            subscriptions,
            version,
        } => FrameBuilder::new(KIND_SUBSCRIBED)
            .version(*version)
            .body(&serde_json::json!({ "subscriptions": subscriptions }))
            .finish(),
        ServerFrame::StateUpdate {
            version,
            timestamp,
            data,
        } => FrameBuilder::new(KIND_STATE_UPDATE)
            .version(*version)
            .timestamp(timestamp)
            .body(&Value::Object(data.clone()))
            .finish(),
        ServerFrame::DiffUpdate {
            version,
            timestamp,
            changes,
        } => FrameBuilder::new(KIND_DIFF_UPDATE)
            .version(*version)
            .timestamp(timestamp)
            .body(&Value::Object(changes.clone()))
            .finish(),
        ServerFrame::Pong => FrameBuilder::new(KIND_PONG).finish(),
        ServerFrame::Error { code, message } => FrameBuilder::new(KIND_ERROR)
            .body(&serde_json::json!({ "code": code, "message": message }))
            .finish(),
        ServerFrame::ShuttingDown => FrameBuilder::new(KIND_SHUTTING_DOWN).finish(),
    }
}

/// Encode a client message into the compact binary framing.
pub fn encode_binary_client(msg: &ClientMessage) -> Vec<u8> {
    match msg {
        ClientMessage::Subscribe { subscriptions } => FrameBuilder::new(KIND_SUBSCRIBE)
            .body(&serde_json::json!({ "subscriptions": subscriptions }))
            .finish(),
        ClientMessage::Unsubscribe { subscriptions } => FrameBuilder::new(KIND_UNSUBSCRIBE)
            .body(&serde_json::json!({ "subscriptions": subscriptions }))
            .finish(),
        ClientMessage::Ping => FrameBuilder::new(KIND_PING).finish(),
    }
}

struct ParsedFrame {
    kind: u8,
    version: Option<u64>,
    timestamp: Option<String>,
    body: Option<Value>,
}

fn parse_frame(buf: &[u8]) -> Result<ParsedFrame, WireError> {
    if buf.len() < 8 {
        return Err(WireError::Truncated);
    }

    let (payload, trailer) = buf.split_at(buf.len() - 4);
    let crc = u32::from_le_bytes(trailer.try_into().expect("4-byte trailer"));
    if crc != crc32(payload) {
        return Err(WireError::ChecksumMismatch);
    }

    let magic = u16::from_le_bytes([payload[0], payload[1]]);
    if magic != WIRE_MAGIC {
        return Err(WireError::InvalidMagic(magic));
    }
    if payload[2] != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(payload[2]));
    }

    let mut frame = ParsedFrame {
        kind: payload[3],
        version: None,
        timestamp: None,
        body: None,
    };

    let mut rest = &payload[4..];
    while !rest.is_empty() {
        if rest.len() < 5 {
            return Err(WireError::Truncated);
        }
        let tag = rest[0];
        let len = u32::from_le_bytes(rest[1..5].try_into().expect("4-byte len")) as usize;
        rest = &rest[5..];
        if rest.len() < len {
            return Err(WireError::Truncated);
        }
        let (data, tail) = rest.split_at(len);
        rest = tail;

        match tag {
            TAG_VERSION => {
                let bytes: [u8; 8] = data.try_into().map_err(|_| WireError::BadField(tag))?;
                frame.version = Some(u64::from_le_bytes(bytes));
            }
            TAG_TIMESTAMP => {
                frame.timestamp = Some(
                    std::str::from_utf8(data)
                        .map_err(|_| WireError::BadField(tag))?
                        .to_string(),
                );
            }
            TAG_BODY => {
                frame.body =
                    Some(serde_json::from_slice(data).map_err(|_| WireError::BadField(tag))?);
            }
            // Unknown tags are skipped so the format can grow.
            _ => {}
        }
    }

    Ok(frame)
}

fn body_object(frame: &ParsedFrame) -> Result<Map<String, Value>, WireError> {
    match &frame.body {
        Some(Value::Object(map)) => Ok(map.clone()),
        _ => Err(WireError::BadField(TAG_BODY)),
    }
}

fn body_subscriptions(frame: &ParsedFrame) -> Result<Vec<String>, WireError> {
    let map = body_object(frame)?;
    Ok(map
        .get("subscriptions")
        .and_then(|s| s.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default())
}

/// Decode a binary server frame. Used by clients and by the test suite to
/// assert bit-exactness of the contract.
pub fn decode_binary(buf: &[u8]) -> Result<ServerFrame, WireError> {
    let frame = parse_frame(buf)?;
    match frame.kind {
        KIND_SUBSCRIBED => Ok(ServerFrame::Subscribed {
            subscriptions: body_subscriptions(&frame)?,
            version: frame.version.ok_or(WireError::BadField(TAG_VERSION))?,
        }),
        KIND_STATE_UPDATE => Ok(ServerFrame::StateUpdate {
            version: frame.version.ok_or(WireError::BadField(TAG_VERSION))?,
            timestamp: frame.timestamp.clone().ok_or(WireError::BadField(TAG_TIMESTAMP))?,
            data: body_object(&frame)?,
        }),
        KIND_DIFF_UPDATE => Ok(ServerFrame::DiffUpdate {
            version: frame.version.ok_or(WireError::BadField(TAG_VERSION))?,
            timestamp: frame.timestamp.clone().ok_or(WireError::BadField(TAG_TIMESTAMP))?,
            changes: body_object(&frame)?,
        }),
        KIND_PONG => Ok(ServerFrame::Pong),
        KIND_ERROR => {
            let map = body_object(&frame)?;
            Ok(ServerFrame::Error {
                code: map
                    .get("code")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                message: map
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            })
        }
        KIND_SHUTTING_DOWN => Ok(ServerFrame::ShuttingDown),
        other => Err(WireError::UnknownFrameKind(other)),
    }
}

/// Decode a binary client frame.
pub fn decode_binary_client(buf: &[u8]) -> Result<ClientMessage, WireError> {
    let frame = parse_frame(buf)?;
    match frame.kind {
        KIND_SUBSCRIBE => Ok(ClientMessage::Subscribe {
            subscriptions: body_subscriptions(&frame)?,
        }),
        KIND_UNSUBSCRIBE => Ok(ClientMessage::Unsubscribe {
            subscriptions: body_subscriptions(&frame)?,
        }),
        KIND_PING => Ok(ClientMessage::Ping),
        other => Err(WireError::UnknownFrameKind(other)),
    }
}

/// CRC32 (IEEE polynomial, reflected), bitwise and table-free.
///
/// Frames are small control payloads, so the branchless per-bit form is
/// plenty; the mask trick folds the polynomial conditionally without a
/// lookup table.
fn crc32(data: &[u8]) -> u32 {
    const POLY: u32 = 0xEDB8_8320;

    let mut state = !0u32;
    for &byte in data {
        state ^= u32::from(byte);
        for _ in 0..8 {
            let fold = (state & 1).wrapping_neg();
            state = (state >> 1) ^ (POLY & fold);
        }
    }
    !state
}
