//! Customer-side sync client.
//!
//! ```text
//!            endpoint open           link open             link closed
//!   Idle ──────────────────► Connecting ──────► Connected ─────────────► Closed
//!                                │                                        ▲
//!                                └──── peer unavailable / error ──► Failed│
//! ```
//!
//! Exactly one outbound link, attempted exactly once. Both `Closed` and
//! `Failed` are terminal: there is no reconnect. The client owns no state of
//! its own beyond the link; everything it learns is applied to the
//! [`TrackingStore`] through the protocol codec, and the caller is told what
//! happened through [`SyncUpdate`].

use crate::protocol::{ProtocolError, ProtocolMessage};
use crate::store::TrackingStore;
use crate::transport::{Endpoint, EndpointId, Link, LinkId};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    /// The link closed after having opened.
    Closed,
    /// The link never opened.
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// What changed after feeding the client an event.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncUpdate {
    /// The link to the driver opened.
    Connected(EndpointId),
    /// A protocol message was applied to the store.
    Applied(&'static str),
    /// The driver ended the delivery.
    DeliveryEnded,
    /// The link is gone for good.
    Disconnected,
}

/// Watches exactly one driver.
#[derive(Debug)]
pub struct SyncClient {
    target: EndpointId,
    state: ConnectionState,
    link: Option<Link>,
}

impl SyncClient {
    pub fn new(target: EndpointId) -> Self {
        Self {
            target,
            state: ConnectionState::Idle,
            link: None,
        }
    }

    pub fn target(&self) -> &EndpointId {
        &self.target
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The local endpoint is up: link to the driver. Only the first call
    /// connects; returns whether it did.
    pub fn on_endpoint_open(&mut self, endpoint: &Endpoint) -> bool {
        if self.state != ConnectionState::Idle {
            return false;
        }
        log::info!("Connecting to driver {}", self.target);
        self.link = Some(endpoint.connect(self.target.clone()));
        self.state = ConnectionState::Connecting;
        true
    }

    /// The connection attempt failed before the link opened.
    pub fn on_connect_failed(&mut self) {
        if !self.state.is_terminal() {
            self.state = ConnectionState::Failed;
            self.link = None;
        }
    }

    pub fn on_link_open(&mut self, id: LinkId, store: &mut TrackingStore) -> Option<SyncUpdate> {
        if !self.owns(id) || self.state != ConnectionState::Connecting {
            return None;
        }
        self.state = ConnectionState::Connected;
        store.activate_remote(self.target.as_str());
        log::info!("Connected to driver {}", self.target);
        Some(SyncUpdate::Connected(self.target.clone()))
    }

    /// Decode a frame from the driver and apply it.
    ///
    /// Unknown message types are ignored; malformed frames are reported and
    /// leave the store untouched.
    pub fn on_data(
        &mut self,
        id: LinkId,
        payload: &str,
        store: &mut TrackingStore,
    ) -> Result<Option<SyncUpdate>, ProtocolError> {
        if !self.owns(id) || self.state.is_terminal() {
            return Ok(None);
        }
        let Some(message) = ProtocolMessage::decode(payload)? else {
            return Ok(None);
        };
        let tag = message.tag();
        log::debug!("Applying {tag} from driver");
        let ended = matches!(message, ProtocolMessage::SessionEnd);
        message.apply(store);
        Ok(Some(if ended {
            SyncUpdate::DeliveryEnded
        } else {
            SyncUpdate::Applied(tag)
        }))
    }

    /// The link closed. One-shot: later calls return `None`.
    pub fn on_link_closed(&mut self, id: LinkId, store: &mut TrackingStore) -> Option<SyncUpdate> {
        if !self.owns(id) || self.state.is_terminal() {
            return None;
        }
        self.state = if self.state == ConnectionState::Connected {
            ConnectionState::Closed
        } else {
            ConnectionState::Failed
        };
        self.link = None;
        store.deactivate();
        log::info!("Link to driver {} closed", self.target);
        Some(SyncUpdate::Disconnected)
    }

    /// Customers never accept links.
    pub fn reject_incoming(&self, link: &Link) {
        log::warn!("Rejecting unexpected incoming link from {}", link.remote());
        link.close();
    }

    /// Close the link, if any.
    pub fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
    }

    fn owns(&self, id: LinkId) -> bool {
        self.link.as_ref().is_some_and(|link| link.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Coordinates, DeliveryMessage, MessageKind, SyncSnapshot};
    use crate::transport::Command;
    use tokio::sync::mpsc;

    fn endpoint() -> (Endpoint, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Endpoint::new(tx), rx)
    }

    /// Client that has connected; returns the link id it used.
    fn connected(store: &mut TrackingStore) -> (SyncClient, LinkId, Endpoint, mpsc::UnboundedReceiver<Command>) {
        let (endpoint, mut rx) = endpoint();
        let mut client = SyncClient::new(EndpointId::from("wagashi-ab12cd"));
        assert!(client.on_endpoint_open(&endpoint));
        let link = match rx.try_recv().unwrap() {
            Command::Connect(link) => link,
            other => panic!("Expected Connect, got {other:?}"),
        };
        link.set_open(true);
        client.on_link_open(link.id(), store);
        (client, link.id(), endpoint, rx)
    }

    #[test]
    fn test_connects_exactly_once() {
        let (endpoint, mut rx) = endpoint();
        let mut client = SyncClient::new(EndpointId::from("wagashi-ab12cd"));

        assert!(client.on_endpoint_open(&endpoint));
        assert!(!client.on_endpoint_open(&endpoint));
        assert_eq!(client.state(), ConnectionState::Connecting);

        match rx.try_recv().unwrap() {
            Command::Connect(link) => assert_eq!(link.remote().as_str(), "wagashi-ab12cd"),
            other => panic!("Expected Connect, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_link_open_activates_session() {
        let mut store = TrackingStore::new();
        let (client, _, _endpoint, _rx) = connected(&mut store);
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(store.is_active());
        assert_eq!(store.session().delivery_id, "wagashi-ab12cd");
    }

    #[test]
    fn test_data_is_applied() {
        let mut store = TrackingStore::new();
        let (mut client, id, _endpoint, _rx) = connected(&mut store);

        let sync = ProtocolMessage::SyncState(SyncSnapshot {
            coordinates: Some(Coordinates::new(35.68, 139.77)),
            messages: vec![DeliveryMessage {
                id: "1".into(),
                text: "started".into(),
                timestamp: "2026-10-19T09:00:00.000Z".into(),
                kind: MessageKind::System,
            }],
        });
        let update = client.on_data(id, &sync.encode().unwrap(), &mut store).unwrap();
        assert_eq!(update, Some(SyncUpdate::Applied("SYNC_STATE")));
        assert_eq!(store.coordinates(), Some(Coordinates::new(35.68, 139.77)));
        assert_eq!(store.messages().len(), 1);
    }

    #[test]
    fn test_session_end_reports_delivery_ended() {
        let mut store = TrackingStore::new();
        let (mut client, id, _endpoint, _rx) = connected(&mut store);

        let frame = ProtocolMessage::SessionEnd.encode().unwrap();
        let update = client.on_data(id, &frame, &mut store).unwrap();
        assert_eq!(update, Some(SyncUpdate::DeliveryEnded));
        assert!(!store.is_active());
        // The link itself is still up.
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_malformed_frame_is_error_and_store_untouched() {
        let mut store = TrackingStore::new();
        let (mut client, id, _endpoint, _rx) = connected(&mut store);

        assert!(client.on_data(id, "{not json", &mut store).is_err());
        assert!(client
            .on_data(id, r#"{"type":"PING"}"#, &mut store)
            .unwrap()
            .is_none());
        assert!(store.messages().is_empty());
        assert!(store.coordinates().is_none());
    }

    #[test]
    fn test_data_on_foreign_link_ignored() {
        let mut store = TrackingStore::new();
        let (mut client, _, _endpoint, _rx) = connected(&mut store);

        let frame = ProtocolMessage::LocationUpdate(Coordinates::new(1.0, 1.0))
            .encode()
            .unwrap();
        assert!(client.on_data(LinkId::new(), &frame, &mut store).unwrap().is_none());
        assert!(store.coordinates().is_none());
    }

    #[test]
    fn test_close_is_terminal_one_shot() {
        let mut store = TrackingStore::new();
        let (mut client, id, _endpoint, _rx) = connected(&mut store);

        assert_eq!(client.on_link_closed(id, &mut store), Some(SyncUpdate::Disconnected));
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(!store.is_active());
        assert_eq!(client.on_link_closed(id, &mut store), None);
    }

    #[test]
    fn test_connect_failure_is_terminal() {
        let (endpoint, _rx) = endpoint();
        let mut client = SyncClient::new(EndpointId::from("wagashi-zzzzzz"));
        client.on_endpoint_open(&endpoint);
        client.on_connect_failed();
        assert_eq!(client.state(), ConnectionState::Failed);
        assert!(!client.on_endpoint_open(&endpoint));
    }
}
