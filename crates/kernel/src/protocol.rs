//! Client message protocol: JSON objects discriminated by a `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use zonehost_common::PartitionId;

/// Messages a client may send once connected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { partition_id: PartitionId },
    Intent { data: Value },
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed { partition_id: PartitionId },
    IntentReceived,
    Error { message: String },
    Tick { tick_number: u64, state: Value },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One unit read from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    /// The transport skipped an unreadable frame and the connection is
    /// still usable; the reason goes back to the client.
    Rejected(String),
}

impl From<String> for InboundFrame {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Why an inbound frame could not be turned into a [`ClientMessage`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("message has no type")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} message: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

const KNOWN_TYPES: &[&str] = &["subscribe", "intent"];

/// Decode one text frame.
pub fn decode(frame: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) | None => return Err(ProtocolError::MissingType),
    };
    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_subscribe() {
        let msg = decode(r#"{"type":"subscribe","partition_id":"p1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                partition_id: PartitionId::new("p1")
            }
        );
    }

    #[test]
    fn decodes_intent_with_opaque_data() {
        let msg = decode(r#"{"type":"intent","data":{"action":"move","dx":1}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Intent {
                data: json!({"action": "move", "dx": 1})
            }
        );
    }

    #[test]
    fn rejects_bad_frames() {
        assert!(matches!(decode("not json"), Err(ProtocolError::Malformed(_))));
        assert_eq!(decode(r#"{"partition_id":"p1"}"#), Err(ProtocolError::MissingType));
        assert_eq!(
            decode(r#"{"type":"teleport"}"#),
            Err(ProtocolError::UnknownType("teleport".into()))
        );
        assert!(matches!(
            decode(r#"{"type":"subscribe"}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn server_messages_use_type_tag() {
        let tick = ServerMessage::Tick {
            tick_number: 3,
            state: json!({"entities": []}),
        };
        assert_eq!(
            serde_json::to_value(&tick).unwrap(),
            json!({"type": "tick", "tick_number": 3, "state": {"entities": []}})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::IntentReceived).unwrap(),
            json!({"type": "intent_received"})
        );
    }
}
