//! JSON protocol exchanged over a driver ⇄ customer link.
//!
//! Wire format (one JSON object per link frame):
//! ```text
//! { "type": "LOCATION_UPDATE", "payload": { "latitude": f64, "longitude": f64 } }
//! { "type": "MESSAGE_ADD",     "payload": { "id", "text", "timestamp", "type": "system" | "ai" } }
//! { "type": "SESSION_END" }
//! { "type": "SYNC_STATE",      "payload": { "coordinates": {…} | null, "messages": [ … ] } }
//! ```
//!
//! The link is assumed reliable and ordered while open, so there are no
//! sequence numbers or acknowledgements at this layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::TrackingStore;

/// A single position fix, sent verbatim from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// Origin of a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Generated by the tracker itself (start/stop of a delivery).
    System,
    /// Free-text status produced by the status generator.
    Ai,
}

/// Immutable timeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryMessage {
    pub id: String,
    pub text: String,
    /// ISO-8601, UTC, millisecond precision.
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

/// Full state pushed to a newly joined viewer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub coordinates: Option<Coordinates>,
    /// Newest first.
    pub messages: Vec<DeliveryMessage>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolMessage {
    LocationUpdate(Coordinates),
    MessageAdd(DeliveryMessage),
    SessionEnd,
    SyncState(SyncSnapshot),
}

impl ProtocolMessage {
    /// Tags this codec understands. Anything else is ignored on decode.
    pub const TAGS: [&'static str; 4] = ["LOCATION_UPDATE", "MESSAGE_ADD", "SESSION_END", "SYNC_STATE"];

    /// The wire tag of this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::LocationUpdate(_) => "LOCATION_UPDATE",
            Self::MessageAdd(_) => "MESSAGE_ADD",
            Self::SessionEnd => "SESSION_END",
            Self::SyncState(_) => "SYNC_STATE",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parse a JSON text frame.
    ///
    /// Returns `Ok(None)` for a well-formed frame whose tag is unknown.
    pub fn decode(frame: &str) -> Result<Option<Self>, ProtocolError> {
        let value: Value = serde_json::from_str(frame).map_err(ProtocolError::Decode)?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingTag)?;

        if !Self::TAGS.contains(&tag) {
            log::debug!("Ignoring unknown protocol message type {tag:?}");
            return Ok(None);
        }

        serde_json::from_value(value)
            .map(Some)
            .map_err(ProtocolError::Decode)
    }

    /// Apply this message to a store. Total: every variant has an effect
    /// and none can fail.
    pub fn apply(self, store: &mut TrackingStore) {
        match self {
            Self::LocationUpdate(coords) => store.set_coordinates(coords),
            Self::MessageAdd(message) => store.prepend_message(message),
            Self::SessionEnd => store.deactivate(),
            Self::SyncState(snapshot) => store.replace(snapshot),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("message has no \"type\" tag")]
    MissingTag,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(id: &str, kind: MessageKind) -> DeliveryMessage {
        DeliveryMessage {
            id: id.to_string(),
            text: format!("text {id}"),
            timestamp: "2026-10-19T09:00:00.000Z".to_string(),
            kind,
        }
    }

    #[test]
    fn test_location_update_wire_shape() {
        let msg = ProtocolMessage::LocationUpdate(Coordinates::new(35.68, 139.77));
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({ "type": "LOCATION_UPDATE", "payload": { "latitude": 35.68, "longitude": 139.77 } })
        );
    }

    #[test]
    fn test_message_add_wire_shape() {
        let msg = ProtocolMessage::MessageAdd(message("1", MessageKind::Ai));
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "MESSAGE_ADD");
        assert_eq!(value["payload"]["type"], "ai");
        assert_eq!(value["payload"]["id"], "1");
        assert_eq!(value["payload"]["timestamp"], "2026-10-19T09:00:00.000Z");
    }

    #[test]
    fn test_session_end_has_no_payload() {
        let encoded = ProtocolMessage::SessionEnd.encode().unwrap();
        assert_eq!(encoded, r#"{"type":"SESSION_END"}"#);
        assert_eq!(
            ProtocolMessage::decode(&encoded).unwrap(),
            Some(ProtocolMessage::SessionEnd)
        );
    }

    #[test]
    fn test_sync_state_null_coordinates() {
        let msg = ProtocolMessage::SyncState(SyncSnapshot::default());
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({ "type": "SYNC_STATE", "payload": { "coordinates": null, "messages": [] } })
        );
    }

    #[test]
    fn test_decode_frame_from_browser_peer() {
        let frame = r#"{"type":"SYNC_STATE","payload":{"coordinates":{"latitude":35.0,"longitude":135.7},
            "messages":[{"id":"1760864400000","text":"Delivery started.","timestamp":"2026-10-19T09:00:00.000Z","type":"system"}]}}"#;
        let decoded = ProtocolMessage::decode(frame).unwrap().unwrap();
        match decoded {
            ProtocolMessage::SyncState(snapshot) => {
                assert_eq!(snapshot.coordinates, Some(Coordinates::new(35.0, 135.7)));
                assert_eq!(snapshot.messages.len(), 1);
                assert_eq!(snapshot.messages[0].kind, MessageKind::System);
            }
            other => panic!("Expected SyncState, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_tag_is_ignored() {
        let frame = r#"{"type":"PING","payload":{"n":1}}"#;
        assert_eq!(ProtocolMessage::decode(frame).unwrap(), None);
    }

    #[test]
    fn test_missing_tag_is_an_error() {
        assert!(matches!(
            ProtocolMessage::decode(r#"{"payload":{}}"#),
            Err(ProtocolError::MissingTag)
        ));
    }

    #[test]
    fn test_decode_invalid_json() {
        assert!(matches!(
            ProtocolMessage::decode("{not json"),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_known_tag_with_bad_payload_is_an_error() {
        let frame = r#"{"type":"LOCATION_UPDATE","payload":{"latitude":"north"}}"#;
        assert!(matches!(
            ProtocolMessage::decode(frame),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_tag_matches_wire() {
        let all = [
            ProtocolMessage::LocationUpdate(Coordinates::new(0.0, 0.0)),
            ProtocolMessage::MessageAdd(message("1", MessageKind::System)),
            ProtocolMessage::SessionEnd,
            ProtocolMessage::SyncState(SyncSnapshot::default()),
        ];
        for msg in all {
            let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
            assert_eq!(value["type"], msg.tag());
            assert!(ProtocolMessage::TAGS.contains(&msg.tag()));
        }
    }

    #[test]
    fn test_message_add_prepends() {
        let mut store = TrackingStore::new();
        for i in 0..5 {
            let before = store.messages().len();
            ProtocolMessage::MessageAdd(message(&i.to_string(), MessageKind::System)).apply(&mut store);
            assert_eq!(store.messages().len(), before + 1);
            assert_eq!(store.messages()[0].id, i.to_string());
        }
        let ids: Vec<&str> = store.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["4", "3", "2", "1", "0"]);
    }

    #[test]
    fn test_sync_state_replaces_not_merges() {
        let mut store = TrackingStore::new();
        ProtocolMessage::MessageAdd(message("local", MessageKind::System)).apply(&mut store);

        let snapshot = SyncSnapshot {
            coordinates: Some(Coordinates::new(1.0, 2.0)),
            messages: vec![message("b", MessageKind::Ai), message("a", MessageKind::System)],
        };
        ProtocolMessage::SyncState(snapshot.clone()).apply(&mut store);

        assert_eq!(store.coordinates(), Some(Coordinates::new(1.0, 2.0)));
        assert_eq!(store.messages(), snapshot.messages.as_slice());
    }

    #[test]
    fn test_sync_state_idempotent() {
        let snapshot = SyncSnapshot {
            coordinates: Some(Coordinates::new(35.68, 139.77)),
            messages: vec![message("2", MessageKind::Ai), message("1", MessageKind::System)],
        };

        let mut once = TrackingStore::new();
        ProtocolMessage::SyncState(snapshot.clone()).apply(&mut once);

        let mut twice = TrackingStore::new();
        ProtocolMessage::SyncState(snapshot.clone()).apply(&mut twice);
        ProtocolMessage::SyncState(snapshot).apply(&mut twice);

        assert_eq!(once.snapshot(), twice.snapshot());
        assert_eq!(once.session(), twice.session());
    }

    #[test]
    fn test_session_end_deactivates() {
        let mut store = TrackingStore::new();
        store.activate_remote("wagashi-ab12cd");
        ProtocolMessage::SessionEnd.apply(&mut store);
        assert!(!store.session().is_active);
    }

    #[test]
    fn test_location_update_replaces() {
        let mut store = TrackingStore::new();
        ProtocolMessage::LocationUpdate(Coordinates::new(1.0, 1.0)).apply(&mut store);
        ProtocolMessage::LocationUpdate(Coordinates::new(2.0, 2.0)).apply(&mut store);
        assert_eq!(store.coordinates(), Some(Coordinates::new(2.0, 2.0)));
    }
}
