//! # wagashi-track: Live delivery tracking over direct peer links
//!
//! A driver broadcasts position and timeline messages; any number of
//! customers watch one driver through a link keyed off the driver's
//! endpoint id, which travels in the fragment of a share URL.
//!
//! ## Architecture
//!
//! ```text
//!  entry URL ──► Identity ──► SessionManager::spawn
//!                                   │
//!               ┌───────────────────┴───────────────────┐
//!               ▼ Driver                                ▼ Customer
//!        ┌─────────────┐   JSON over Link        ┌─────────────┐
//!        │BroadcastHub │ ──────────────────────► │ SyncClient  │
//!        │ (N viewers) │   SYNC_STATE on join    │ (1 driver)  │
//!        └──────┬──────┘                         └──────┬──────┘
//!               │                                       │
//!               ▼                                       ▼
//!        ┌─────────────┐                         ┌─────────────┐
//!        │TrackingStore│ ◄── GeolocationWatcher  │TrackingStore│
//!        │(authority)  │                         │ (replica)   │
//!        └─────────────┘                         └─────────────┘
//! ```
//!
//! Links are brokered by a third-party connection broker behind the
//! [`transport::Broker`] trait: [`MemoryBroker`] in process,
//! [`WsBroker`] over a WebSocket relay.
//!
//! ## Modules
//!
//! - [`identity`]: role and target id from the entry URL, driver id generation
//! - [`transport`]: endpoints, links, broker adapters
//! - [`protocol`]: the four wire messages and how each is applied
//! - [`hub`]: driver fan-out and viewer count
//! - [`sync`]: customer link state machine
//! - [`store`]: location, newest-first timeline, session flag
//! - [`geo`]: position sources and the watcher
//! - [`status`]: generated status lines with fallback
//! - [`session`]: the event loop that owns all of the above

pub mod config;
pub mod error;
pub mod geo;
pub mod hub;
pub mod identity;
pub mod protocol;
pub mod session;
pub mod status;
pub mod store;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use config::{ConfigError, TrackerConfig};
pub use error::{Error, Result};
pub use geo::{
    FeedSource, Feeder, GeoError, GeolocationWatcher, PositionSource, RouteConfig, RouteSimulator, WatchOptions,
    WatcherState,
};
pub use hub::{BroadcastHub, HubStats};
pub use identity::{generate_driver_id, share_link, Identity, Role};
pub use protocol::{Coordinates, DeliveryMessage, MessageKind, ProtocolError, ProtocolMessage, SyncSnapshot};
pub use session::{
    Condition, PeerStatus, SessionCommand, SessionEvent, SessionHandle, SessionManager, SessionView,
};
pub use status::{PhraseGenerator, StatusConfig, StatusContext, StatusError, StatusGenerator};
pub use store::{TrackingSession, TrackingStore};
pub use sync::{ConnectionState, SyncClient, SyncUpdate};
pub use transport::{
    Broker, BrokerFrame, Endpoint, EndpointId, Link, LinkId, MemoryBroker, TransportError, TransportEvent, WsBroker,
};
