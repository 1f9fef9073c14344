//! Event normalization
//!
//! Turns a decoded client frame into the record published on the event
//! stream: the typed payload is parsed and validated, then stamped with the
//! sender's identity, session, source gateway and a server timestamp.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{EventType, ProtocolError};
use crate::session::ClientInfo;

/// Longest accepted identifier
const MAX_ID_LEN: usize = 128;
/// Longest accepted reaction
const MAX_REACTION_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: String,
    pub message: String,
    /// Client-side dedup id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditMessage {
    pub conversation_id: String,
    pub message_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteMessage {
    pub conversation_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub conversation_id: String,
    pub message_id: String,
    pub reaction: String,
    #[serde(default)]
    pub remove: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub conversation_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Typing {
    pub conversation_id: String,
    pub is_typing: bool,
}

/// Offer or answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSdp {
    pub call_id: String,
    pub target_user_id: String,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallIceCandidate {
    pub call_id: String,
    pub target_user_id: String,
    pub candidate: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnd {
    pub call_id: String,
    pub target_user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Typed event body
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventData {
    NewMessage(NewMessage),
    EditMessage(EditMessage),
    DeleteMessage(DeleteMessage),
    Reaction(Reaction),
    ReadReceipt(ReadReceipt),
    Typing(Typing),
    CallOffer(CallSdp),
    CallAnswer(CallSdp),
    CallIceCandidate(CallIceCandidate),
    CallEnd(CallEnd),
}

impl EventData {
    /// Parse and validate the payload of one event type
    pub fn parse(event_type: EventType, payload: Value) -> Result<Self, ProtocolError> {
        let data = match event_type {
            EventType::NewMessage => EventData::NewMessage(typed(payload)?),
            EventType::EditMessage => EventData::EditMessage(typed(payload)?),
            EventType::DeleteMessage => EventData::DeleteMessage(typed(payload)?),
            EventType::ReactMessage => EventData::Reaction(typed(payload)?),
            EventType::ReadReceipt => EventData::ReadReceipt(typed(payload)?),
            EventType::TypingStatus => EventData::Typing(typed(payload)?),
            EventType::CallOffer => EventData::CallOffer(typed(payload)?),
            EventType::CallAnswer => EventData::CallAnswer(typed(payload)?),
            EventType::CallIceCandidate => EventData::CallIceCandidate(typed(payload)?),
            EventType::CallEnd => EventData::CallEnd(typed(payload)?),
        };
        data.validate()?;
        Ok(data)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            EventData::NewMessage(m) => {
                identifier("conversation_id", &m.conversation_id)?;
                body("message", &m.message)?;
                if let Some(id) = &m.client_message_id {
                    identifier("client_message_id", id)?;
                }
            }
            EventData::EditMessage(m) => {
                identifier("conversation_id", &m.conversation_id)?;
                identifier("message_id", &m.message_id)?;
                body("message", &m.message)?;
            }
            EventData::DeleteMessage(m) => {
                identifier("conversation_id", &m.conversation_id)?;
                identifier("message_id", &m.message_id)?;
            }
            EventData::Reaction(r) => {
                identifier("conversation_id", &r.conversation_id)?;
                identifier("message_id", &r.message_id)?;
                body("reaction", &r.reaction)?;
                if r.reaction.chars().count() > MAX_REACTION_LEN {
                    return Err(ProtocolError::InvalidField("reaction", "too long"));
                }
            }
            EventData::ReadReceipt(r) => {
                identifier("conversation_id", &r.conversation_id)?;
                identifier("message_id", &r.message_id)?;
            }
            EventData::Typing(t) => identifier("conversation_id", &t.conversation_id)?,
            EventData::CallOffer(c) | EventData::CallAnswer(c) => {
                identifier("call_id", &c.call_id)?;
                identifier("target_user_id", &c.target_user_id)?;
                body("sdp", &c.sdp)?;
            }
            EventData::CallIceCandidate(c) => {
                identifier("call_id", &c.call_id)?;
                identifier("target_user_id", &c.target_user_id)?;
                if c.candidate.is_null() {
                    return Err(ProtocolError::InvalidField("candidate", "missing"));
                }
            }
            EventData::CallEnd(c) => {
                identifier("call_id", &c.call_id)?;
                identifier("target_user_id", &c.target_user_id)?;
            }
        }
        Ok(())
    }

    /// Partition key: conversation for chat families, call for signaling
    pub fn partition_key(&self) -> &str {
        match self {
            EventData::NewMessage(m) => &m.conversation_id,
            EventData::EditMessage(m) => &m.conversation_id,
            EventData::DeleteMessage(m) => &m.conversation_id,
            EventData::Reaction(r) => &r.conversation_id,
            EventData::ReadReceipt(r) => &r.conversation_id,
            EventData::Typing(t) => &t.conversation_id,
            EventData::CallOffer(c) | EventData::CallAnswer(c) => &c.call_id,
            EventData::CallIceCandidate(c) => &c.call_id,
            EventData::CallEnd(c) => &c.call_id,
        }
    }
}

fn typed<T: DeserializeOwned>(payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(ProtocolError::InvalidPayload)
}

fn identifier(field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.is_empty() {
        return Err(ProtocolError::InvalidField(field, "must not be empty"));
    }
    if value.chars().count() > MAX_ID_LEN {
        return Err(ProtocolError::InvalidField(field, "too long"));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ProtocolError::InvalidField(field, "contains whitespace or control characters"));
    }
    Ok(())
}

fn body(field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        return Err(ProtocolError::InvalidField(field, "must not be empty"));
    }
    Ok(())
}

/// Record published to the event stream
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedEvent {
    pub event_id: String,
    pub event_type: &'static str,
    pub sender_id: String,
    pub session_id: String,
    pub connection_id: String,
    /// Gateway that received the frame
    pub instance_id: String,
    /// Unix milliseconds
    pub timestamp: i64,
    pub data: EventData,
}

impl NormalizedEvent {
    pub fn partition_key(&self) -> &str {
        self.data.partition_key()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Attach sender identity, session and timestamp to a client event
pub fn normalize(
    event_type: EventType,
    payload: Value,
    info: &ClientInfo,
    instance_id: &str,
) -> Result<NormalizedEvent, ProtocolError> {
    let data = EventData::parse(event_type, payload)?;

    Ok(NormalizedEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        event_type: event_type.as_str(),
        sender_id: info.user_id.clone(),
        session_id: info.session_id.clone(),
        connection_id: info.connection_id.clone(),
        instance_id: instance_id.to_string(),
        timestamp: Utc::now().timestamp_millis(),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info() -> ClientInfo {
        ClientInfo::new(
            "user_a".to_string(),
            "sess_a".to_string(),
            "127.0.0.1".to_string(),
            "test".to_string(),
        )
    }

    #[test]
    fn test_normalize_new_message() {
        let info = info();
        let event = normalize(
            EventType::NewMessage,
            json!({"conversation_id": "c1", "message": "hi"}),
            &info,
            "gw-a",
        )
        .unwrap();

        assert_eq!(event.event_type, "new_message");
        assert_eq!(event.sender_id, "user_a");
        assert_eq!(event.session_id, "sess_a");
        assert_eq!(event.connection_id, info.connection_id);
        assert_eq!(event.partition_key(), "c1");
        assert!(event.timestamp > 0);

        let json: Value = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(json["data"]["message"], "hi");
        assert_eq!(json["data"]["conversation_id"], "c1");
        assert_eq!(json["instance_id"], "gw-a");
    }

    #[test]
    fn test_event_ids_are_fresh() {
        let info = info();
        let payload = json!({"conversation_id": "c1", "is_typing": true});
        let a = normalize(EventType::TypingStatus, payload.clone(), &info, "gw").unwrap();
        let b = normalize(EventType::TypingStatus, payload, &info, "gw").unwrap();
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_call_events_key_by_call_id() {
        let data = EventData::parse(
            EventType::CallIceCandidate,
            json!({"call_id": "call-9", "target_user_id": "u2", "candidate": {"sdpMid": "0"}}),
        )
        .unwrap();
        assert_eq!(data.partition_key(), "call-9");
    }

    #[test]
    fn test_missing_field_is_invalid_payload() {
        let err = EventData::parse(EventType::EditMessage, json!({"conversation_id": "c1"}))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_payload");

        let err = EventData::parse(EventType::CallEnd, Value::Null).unwrap_err();
        assert_eq!(err.code(), "invalid_payload");
    }

    #[test]
    fn test_identifier_validation() {
        let err = EventData::parse(
            EventType::DeleteMessage,
            json!({"conversation_id": "", "message_id": "m1"}),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField("conversation_id", _)));

        let err = EventData::parse(
            EventType::ReadReceipt,
            json!({"conversation_id": "c 1", "message_id": "m1"}),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField("conversation_id", _)));

        let long = "x".repeat(MAX_ID_LEN + 1);
        let err = EventData::parse(
            EventType::ReadReceipt,
            json!({"conversation_id": "c1", "message_id": long}),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField("message_id", "too long")));
    }

    #[test]
    fn test_empty_body_rejected() {
        let err = EventData::parse(
            EventType::NewMessage,
            json!({"conversation_id": "c1", "message": "   "}),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField("message", _)));
    }

    #[test]
    fn test_reaction_defaults() {
        let data = EventData::parse(
            EventType::ReactMessage,
            json!({"conversation_id": "c1", "message_id": "m1", "reaction": "+1"}),
        )
        .unwrap();
        match data {
            EventData::Reaction(r) => assert!(!r.remove),
            other => panic!("unexpected {other:?}"),
        }
    }
}
