// chat-protocol: Wire records, codecs, and framing for the chat service.
//
// Every frame on the wire is either a `ChatMessage` (client -> server
// requests, and server-initiated notifications) or a `ServerResponse`
// (server -> client). Both are flat records with a `kind` tag; the
// dispatcher-facing `Request` union in `request` is derived from a decoded
// `ChatMessage` by validation.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod binary;
pub mod json;
pub mod request;

pub use binary::BinaryProtocol;
pub use json::JsonProtocol;
pub use request::{MarkReadTarget, Request, RequestError};

/// Hard cap on the UTF-8 encoded size of a message `content` field, and on a
/// binary frame's payload length. Oversized frames are rejected without
/// desynchronizing the stream.
pub const MAX_CONTENT_BYTES: usize = 1_000_000;

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// All frame kinds in the wire protocol.
///
/// The numeric codes are the binary codec's kind bytes and are frozen for a
/// deployment: 0 = server_response, 1 = login, 2 = logout, 3 = join,
/// 4 = register, 5 = chat, 6 = dm, 7 = fetch, 8 = mark_read, 9 = delete,
/// 10 = delete_notification, 11 = delete_account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    ServerResponse,
    Login,
    Logout,
    Join,
    Register,
    Chat,
    Dm,
    Fetch,
    MarkRead,
    Delete,
    DeleteNotification,
    DeleteAccount,
}

impl MessageKind {
    /// The stable kind byte used by the binary codec.
    pub const fn code(self) -> u8 {
        match self {
            MessageKind::ServerResponse => 0,
            MessageKind::Login => 1,
            MessageKind::Logout => 2,
            MessageKind::Join => 3,
            MessageKind::Register => 4,
            MessageKind::Chat => 5,
            MessageKind::Dm => 6,
            MessageKind::Fetch => 7,
            MessageKind::MarkRead => 8,
            MessageKind::Delete => 9,
            MessageKind::DeleteNotification => 10,
            MessageKind::DeleteAccount => 11,
        }
    }

    /// Reverse of [`MessageKind::code`]; `None` for bytes outside the enum.
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => MessageKind::ServerResponse,
            1 => MessageKind::Login,
            2 => MessageKind::Logout,
            3 => MessageKind::Join,
            4 => MessageKind::Register,
            5 => MessageKind::Chat,
            6 => MessageKind::Dm,
            7 => MessageKind::Fetch,
            8 => MessageKind::MarkRead,
            9 => MessageKind::Delete,
            10 => MessageKind::DeleteNotification,
            11 => MessageKind::DeleteAccount,
            _ => return None,
        })
    }

    /// The snake_case name used on the JSON wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageKind::ServerResponse => "server_response",
            MessageKind::Login => "login",
            MessageKind::Logout => "logout",
            MessageKind::Join => "join",
            MessageKind::Register => "register",
            MessageKind::Chat => "chat",
            MessageKind::Dm => "dm",
            MessageKind::Fetch => "fetch",
            MessageKind::MarkRead => "mark_read",
            MessageKind::Delete => "delete",
            MessageKind::DeleteNotification => "delete_notification",
            MessageKind::DeleteAccount => "delete_account",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response status: 0 = success, 1 = error on the binary wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
}

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

/// The flat wire record carried by every non-response frame.
///
/// Which optional fields are populated depends on `kind`; the validated view
/// for the dispatcher is [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub kind: MessageKind,
    /// The acting principal (sender for DMs, subject for notifications).
    pub username: String,
    #[serde(default)]
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Store-assigned id; present on stored/delivered messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_count: Option<u32>,
    /// Ids to mark read or delete; also echoed in delete notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_ids: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_users: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
}

impl ChatMessage {
    /// A record with the given kind, principal, and content; all optional
    /// fields absent and the timestamp taken now.
    pub fn new(
        kind: MessageKind,
        username: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        ChatMessage {
            kind,
            username: username.into(),
            content: content.into(),
            timestamp: Utc::now(),
            message_id: None,
            recipients: None,
            fetch_count: None,
            message_ids: None,
            password: None,
            active_users: None,
            unread_count: None,
        }
    }

    pub fn with_recipients(mut self, recipients: Vec<String>) -> Self {
        self.recipients = Some(recipients);
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_message_ids(mut self, ids: Vec<u32>) -> Self {
        self.message_ids = Some(ids);
        self
    }

    pub fn with_unread_count(mut self, count: u32) -> Self {
        self.unread_count = Some(count);
        self
    }

    pub fn with_active_users(mut self, users: Vec<String>) -> Self {
        self.active_users = Some(users);
        self
    }

    pub fn with_fetch_count(mut self, count: u32) -> Self {
        self.fetch_count = Some(count);
        self
    }
}

/// The server's reply frame. `data` embeds a full `ChatMessage` when the
/// response carries a delivered message or a roster/notification record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerResponse {
    pub status: Status,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
}

impl ServerResponse {
    pub fn success(message: impl Into<String>) -> Self {
        ServerResponse {
            status: Status::Success,
            message: message.into(),
            data: None,
            unread_count: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerResponse {
            status: Status::Error,
            message: message.into(),
            data: None,
            unread_count: None,
        }
    }

    pub fn with_data(mut self, data: ChatMessage) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_unread_count(mut self, count: u32) -> Self {
        self.unread_count = Some(count);
        self
    }
}

// ---------------------------------------------------------------------------
// Codec interface
// ---------------------------------------------------------------------------

/// Errors from encoding, decoding, or frame extraction.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message content exceeds {MAX_CONTENT_BYTES} byte limit")]
    ContentTooLarge,
    #[error("invalid kind byte {0:#04x}")]
    InvalidKind(u8),
    #[error("frame payload of {0} bytes exceeds {MAX_CONTENT_BYTES} byte limit")]
    OversizedFrame(usize),
    #[error("frame truncated while reading {0}")]
    Truncated(&'static str),
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("{0} list exceeds 255 entries")]
    ListTooLong(&'static str),
    #[error("response data flag set but no embedded record present")]
    MissingEmbedded,
    #[error("JSON codec: {0}")]
    Json(#[from] serde_json::Error),
}

/// One wire encoding: record <-> framed bytes, plus stateful frame
/// extraction from an append-only receive buffer.
///
/// `encode_*` returns a complete frame ready for a single write.
/// `extract_frame` consumes exactly one frame from the front of `buffer`
/// when one is complete, leaves partial frames in place, and skips past
/// corrupt headers (reporting the error) without desynchronizing.
pub trait WireProtocol: Send + Sync {
    fn encode_message(&self, message: &ChatMessage) -> Result<Bytes, ProtocolError>;
    fn decode_message(&self, frame: &[u8]) -> Result<ChatMessage, ProtocolError>;
    fn encode_response(&self, response: &ServerResponse) -> Result<Bytes, ProtocolError>;
    fn decode_response(&self, frame: &[u8]) -> Result<ServerResponse, ProtocolError>;
    fn extract_frame(&self, buffer: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError>;
}

/// Which codec a process speaks; chosen out-of-band at launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Json,
    Custom,
}

impl ProtocolKind {
    pub fn create(self) -> Box<dyn WireProtocol> {
        match self {
            ProtocolKind::Json => Box::new(JsonProtocol),
            ProtocolKind::Custom => Box::new(BinaryProtocol),
        }
    }
}

impl std::str::FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(ProtocolKind::Json),
            "custom" => Ok(ProtocolKind::Custom),
            other => Err(format!("unknown protocol type: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_round_trip() {
        for code in 0..=11u8 {
            let kind = MessageKind::from_code(code).expect("codes 0..=11 are assigned");
            assert_eq!(kind.code(), code);
        }
        assert_eq!(MessageKind::from_code(12), None);
        assert_eq!(MessageKind::from_code(0xFF), None);
    }

    #[test]
    fn kind_json_names_match_wire_names() {
        for code in 0..=11u8 {
            let kind = MessageKind::from_code(code).unwrap();
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
