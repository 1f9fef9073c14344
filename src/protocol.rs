//! Client wire protocol
//!
//! ## Client Frames
//! Every frame (text or binary) is a JSON envelope `{"type": int, "payload": any}`.
//!
//! | type | event |
//! |------|-------|
//! | 0 | new-message |
//! | 1 | edit-message |
//! | 2 | delete-message |
//! | 3 | react-message |
//! | 4 | read-receipt |
//! | 5 | typing-status |
//! | 6 | call-offer |
//! | 7 | call-answer |
//! | 8 | call-ice-candidate |
//! | 9 | call-end |
//!
//! ## Server Frames
//! - `welcome`: connection registered
//! - `ack`: event accepted by the event stream
//! - `error`: frame rejected, connection stays open

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Close code: handshake token expired
pub const CLOSE_TOKEN_EXPIRED: u16 = 4001;
/// Close code: handshake token invalid
pub const CLOSE_TOKEN_INVALID: u16 = 4002;
/// Close code: per-user connection cap reached
pub const CLOSE_CONNECTION_LIMIT: u16 = 4008;
/// Close code: hub saturated, retry later
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
/// Close code: repeated rate-limit violations
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code: idle timeout or server shutdown
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Client event types, numbered as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EventType {
    NewMessage = 0,
    EditMessage = 1,
    DeleteMessage = 2,
    ReactMessage = 3,
    ReadReceipt = 4,
    TypingStatus = 5,
    CallOffer = 6,
    CallAnswer = 7,
    CallIceCandidate = 8,
    CallEnd = 9,
}

impl EventType {
    /// Event stream family this event type is published under
    pub fn family(self) -> EventFamily {
        match self {
            EventType::NewMessage => EventFamily::NewMessage,
            EventType::EditMessage => EventFamily::EditMessage,
            EventType::DeleteMessage => EventFamily::DeleteMessage,
            EventType::ReactMessage => EventFamily::Reaction,
            EventType::ReadReceipt => EventFamily::ReadReceipt,
            EventType::TypingStatus => EventFamily::Typing,
            EventType::CallOffer
            | EventType::CallAnswer
            | EventType::CallIceCandidate
            | EventType::CallEnd => EventFamily::CallSignal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::NewMessage => "new_message",
            EventType::EditMessage => "edit_message",
            EventType::DeleteMessage => "delete_message",
            EventType::ReactMessage => "react_message",
            EventType::ReadReceipt => "read_receipt",
            EventType::TypingStatus => "typing_status",
            EventType::CallOffer => "call_offer",
            EventType::CallAnswer => "call_answer",
            EventType::CallIceCandidate => "call_ice_candidate",
            EventType::CallEnd => "call_end",
        }
    }
}

impl TryFrom<i32> for EventType {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => EventType::NewMessage,
            1 => EventType::EditMessage,
            2 => EventType::DeleteMessage,
            3 => EventType::ReactMessage,
            4 => EventType::ReadReceipt,
            5 => EventType::TypingStatus,
            6 => EventType::CallOffer,
            7 => EventType::CallAnswer,
            8 => EventType::CallIceCandidate,
            9 => EventType::CallEnd,
            other => return Err(ProtocolError::UnknownEventType(other)),
        })
    }
}

/// Event stream families, one topic each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFamily {
    NewMessage,
    EditMessage,
    DeleteMessage,
    Reaction,
    ReadReceipt,
    Typing,
    CallSignal,
}

impl EventFamily {
    pub const ALL: [EventFamily; 7] = [
        EventFamily::NewMessage,
        EventFamily::EditMessage,
        EventFamily::DeleteMessage,
        EventFamily::Reaction,
        EventFamily::ReadReceipt,
        EventFamily::Typing,
        EventFamily::CallSignal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventFamily::NewMessage => "new_message",
            EventFamily::EditMessage => "edit_message",
            EventFamily::DeleteMessage => "delete_message",
            EventFamily::Reaction => "reaction",
            EventFamily::ReadReceipt => "read_receipt",
            EventFamily::Typing => "typing",
            EventFamily::CallSignal => "call_signal",
        }
    }
}

/// A decoded client frame
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub event_type: i32,
    #[serde(default)]
    pub payload: Value,
}

/// Server-to-client frames
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        connection_id: String,
    },
    Ack {
        event_type: i32,
        event_id: String,
    },
    Error {
        code: &'static str,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<i32>,
    },
}

impl ServerFrame {
    /// Error frame for a rejected client frame
    pub fn error(err: &ProtocolError, event_type: Option<i32>) -> Self {
        ServerFrame::Error {
            code: err.code(),
            message: err.to_string(),
            event_type,
        }
    }

    /// Encode as a JSON text frame body
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Parse a client frame from raw bytes
pub fn decode_frame(data: &[u8]) -> Result<ClientFrame, ProtocolError> {
    serde_json::from_slice(data).map_err(ProtocolError::Malformed)
}

/// Protocol errors; the offending frame is rejected, the connection stays open
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown event type: {0}")]
    UnknownEventType(i32),
    #[error("invalid payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),
    #[error("invalid field {0}: {1}")]
    InvalidField(&'static str, &'static str),
    #[error("event delivery failed")]
    DeliveryFailed,
}

impl ProtocolError {
    /// Stable machine-readable code carried in error frames
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed_frame",
            ProtocolError::UnknownEventType(_) => "unknown_event_type",
            ProtocolError::InvalidPayload(_) => "invalid_payload",
            ProtocolError::InvalidField(..) => "invalid_field",
            ProtocolError::DeliveryFailed => "delivery_failed",
        }
    }
}
