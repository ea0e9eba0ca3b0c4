//! Gateway wire protocol shared by windows and the backend.
//!
//! Every frame is one JSON object on its own line:
//! `{"type": "...", "correlationId": "...", "data": {...}}`.
//! Byte payloads (`input`/`output`) travel base64-encoded.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Terminal grid size in character cells.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GridSize {
    pub cols: u16,
    pub rows: u16,
}

impl GridSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

/// Envelope carrying an optional correlation id next to the tagged payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope<P> {
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub payload: P,
}

impl<P> Envelope<P> {
    pub fn new(payload: P) -> Self {
        Self {
            correlation_id: None,
            payload,
        }
    }

    pub fn correlated(correlation_id: impl Into<String>, payload: P) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            payload,
        }
    }
}

pub type ClientMessage = Envelope<ClientPayload>;
pub type ServerMessage = Envelope<ServerPayload>;

/// Window → gateway requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientPayload {
    Spawn(SpawnRequest),
    Reconnect(ReconnectRequest),
    /// Graceful release. Never terminates the multiplexer session.
    Disconnect(HandleRef),
    /// Destructive termination of the multiplexer session.
    Close(CloseRequest),
    Input(IoChunk),
    Resize(ResizeRequest),
    ListSessions,
    /// First frame of a window's connection: who is on the other end.
    Hello(WindowHello),
}

/// Gateway → window replies and pushes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerPayload {
    Spawned(Spawned),
    Error(ErrorReply),
    Closed(ClosedReply),
    Output(IoChunk),
    OwnershipRevoked(OwnershipRevoked),
    ProcessGone(ProcessGone),
    SessionList(SessionList),
    /// Reply to `hello`: every window currently connected, the sender included.
    LiveWindows(LiveWindows),
    /// A window's connection dropped; whatever it held is orphaned.
    WindowGone(WindowGone),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub tool_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Explicit name request; generated from the tool type when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplexer_session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<GridSize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectRequest {
    pub multiplexer_session_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<GridSize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HandleRef {
    pub connection_handle: String,
}

/// Close by live handle, or by name for sessions nobody is attached to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloseRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplexer_session_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IoChunk {
    pub connection_handle: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResizeRequest {
    pub connection_handle: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Spawned {
    pub multiplexer_session_name: String,
    pub connection_handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    AlreadyExists,
    NotFound,
    ProcessGone,
    InvalidRequest,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClosedReply {
    pub multiplexer_session_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipRevoked {
    pub connection_handle: String,
    pub multiplexer_session_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessGone {
    pub multiplexer_session_name: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionList {
    pub sessions: Vec<ListedSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListedSession {
    pub name: String,
    /// True when some connection currently owns it in the registry.
    pub owned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WindowHello {
    pub window_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LiveWindows {
    pub window_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WindowGone {
    pub window_id: String,
}

impl ServerMessage {
    /// Error reply echoing `correlation_id`.
    pub fn error(correlation_id: Option<String>, code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            correlation_id,
            payload: ServerPayload::Error(ErrorReply {
                code,
                reason: reason.into(),
            }),
        }
    }
}

/// Serialize one frame, newline-terminated.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one frame (trailing whitespace tolerated).
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
