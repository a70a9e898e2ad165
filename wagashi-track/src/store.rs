//! Session/timeline state store.
//!
//! Plain in-memory container owned by the session event loop. On the driver
//! it is the authoritative copy; on a customer it is only ever mutated by
//! applying inbound [`ProtocolMessage`](crate::protocol::ProtocolMessage)s.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::protocol::{Coordinates, DeliveryMessage, MessageKind, SyncSnapshot};

/// Whether a delivery is currently running and who is running it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackingSession {
    pub is_active: bool,
    pub start_time: Option<DateTime<Utc>>,
    /// The driver's endpoint id. Empty until known.
    pub delivery_id: String,
}

/// Time-based message ids, bumped on collision.
///
/// Ids are millisecond timestamps; two messages recorded within the same
/// millisecond get consecutive values, so ids stay unique and increasing
/// for the lifetime of the generator.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    last: i64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self, now: DateTime<Utc>) -> String {
        let id = now.timestamp_millis().max(self.last + 1);
        self.last = id;
        id.to_string()
    }
}

/// The tracker's state: location, newest-first timeline, session flag.
#[derive(Debug, Default)]
pub struct TrackingStore {
    coordinates: Option<Coordinates>,
    messages: Vec<DeliveryMessage>,
    session: TrackingSession,
    ids: MessageIdGenerator,
}

impl TrackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        self.coordinates
    }

    /// Timeline, newest first.
    pub fn messages(&self) -> &[DeliveryMessage] {
        &self.messages
    }

    pub fn session(&self) -> &TrackingSession {
        &self.session
    }

    pub fn is_active(&self) -> bool {
        self.session.is_active
    }

    pub fn set_coordinates(&mut self, coords: Coordinates) {
        self.coordinates = Some(coords);
    }

    pub fn prepend_message(&mut self, message: DeliveryMessage) {
        self.messages.insert(0, message);
    }

    /// Replace location and timeline wholesale with a driver snapshot.
    pub fn replace(&mut self, snapshot: SyncSnapshot) {
        self.coordinates = snapshot.coordinates;
        self.messages = snapshot.messages;
    }

    /// Create a new timeline entry, prepend it, and return it for broadcast.
    pub fn record(&mut self, kind: MessageKind, text: impl Into<String>, now: DateTime<Utc>) -> DeliveryMessage {
        let message = DeliveryMessage {
            id: self.ids.next_id(now),
            text: text.into(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            kind,
        };
        self.prepend_message(message.clone());
        message
    }

    /// Driver: the broker assigned our endpoint id.
    pub fn set_delivery_id(&mut self, id: impl Into<String>) {
        self.session.delivery_id = id.into();
    }

    /// Driver: begin a delivery.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.session.is_active = true;
        self.session.start_time = Some(now);
    }

    /// Customer: the link to the driver opened.
    pub fn activate_remote(&mut self, delivery_id: impl Into<String>) {
        self.session.is_active = true;
        self.session.delivery_id = delivery_id.into();
    }

    /// End of delivery, from either side. Keeps `start_time`.
    pub fn deactivate(&mut self) {
        self.session.is_active = false;
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            coordinates: self.coordinates,
            messages: self.messages.clone(),
        }
    }
}
