//! Peer transport: local endpoint, links, and the connection broker seam.
//!
//! ```text
//!   Session loop ──commands──► broker task ──► connection broker
//!        ▲                         │
//!        └──── TransportEvent ◄────┘
//! ```
//!
//! A [`Broker`] opens an [`Endpoint`] and hands back the stream of
//! [`TransportEvent`]s for it. Opening is asynchronous: the assigned id (or
//! the refusal) arrives as the first event. Links are cheap cloneable
//! handles; sending on one never blocks and never waits for the remote.

pub mod memory;
pub mod ws;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ProtocolError, ProtocolMessage};

pub use memory::MemoryBroker;
pub use ws::{BrokerFrame, WsBroker};

/// Identity of a peer endpoint as known to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EndpointId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one link. Both ends of a link share the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(Uuid);

impl LinkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle events for one endpoint and all of its links.
#[derive(Debug)]
pub enum TransportEvent {
    /// The broker accepted the endpoint under this id.
    Open(EndpointId),
    /// A remote endpoint initiated a link to us. Not yet open.
    IncomingLink(Link),
    /// The link can carry data.
    LinkOpen(LinkId),
    /// One frame arrived on the link.
    LinkData { link: LinkId, payload: String },
    /// The link is gone, from either side.
    LinkClosed(LinkId),
    /// Broker-level failure.
    Error(TransportError),
}

/// Receiving half of an endpoint's event stream.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Requests from endpoint/link handles to the broker task.
#[derive(Debug)]
pub(crate) enum Command {
    Connect(Link),
    Send { link: LinkId, payload: String },
    Close { link: LinkId },
    Destroy,
}

/// Handle to one point-to-point link.
#[derive(Debug, Clone)]
pub struct Link {
    id: LinkId,
    remote: EndpointId,
    open: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Link {
    pub(crate) fn new(id: LinkId, remote: EndpointId, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            id,
            remote,
            open: Arc::new(AtomicBool::new(false)),
            commands,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// The endpoint on the other side.
    pub fn remote(&self) -> &EndpointId {
        &self.remote
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Flipped by the broker task just before it emits `LinkOpen`/`LinkClosed`.
    pub(crate) fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    /// Encode and queue a protocol message.
    pub fn send(&self, message: &ProtocolMessage) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::LinkClosed);
        }
        self.send_raw(message.encode()?)
    }

    /// Queue an already-encoded frame.
    pub fn send_raw(&self, payload: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::LinkClosed);
        }
        self.commands
            .send(Command::Send { link: self.id, payload })
            .map_err(|_| TransportError::Destroyed)
    }

    /// Close the link. Both sides receive `LinkClosed`.
    pub fn close(&self) {
        self.set_open(false);
        let _ = self.commands.send(Command::Close { link: self.id });
    }
}

/// The local peer endpoint.
///
/// Dropping the endpoint destroys it: the broker releases the id and
/// closes every link it participates in.
#[derive(Debug)]
pub struct Endpoint {
    commands: mpsc::UnboundedSender<Command>,
    destroyed: bool,
}

impl Endpoint {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            commands,
            destroyed: false,
        }
    }

    /// Start a link to `target`. The returned handle opens later, signalled
    /// by `LinkOpen`; an unknown target is reported as
    /// `TransportError::PeerUnavailable`.
    pub fn connect(&self, target: EndpointId) -> Link {
        let link = Link::new(LinkId::new(), target, self.commands.clone());
        if self.commands.send(Command::Connect(link.clone())).is_err() {
            log::warn!("Connect to {} after endpoint shut down", link.remote());
        }
        link
    }

    /// Release the endpoint and all of its links. Idempotent.
    pub fn destroy(&mut self) {
        if !self.destroyed {
            self.destroyed = true;
            let _ = self.commands.send(Command::Destroy);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// A connection broker that can open local endpoints.
///
/// Implementations spawn onto the current tokio runtime.
pub trait Broker {
    /// Open an endpoint, claiming `id_hint` or letting the broker assign one.
    fn open(&self, id_hint: Option<EndpointId>) -> (Endpoint, TransportEvents);
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unavailable")]
    PeerUnavailable(EndpointId),

    #[error("endpoint id {0} is already taken")]
    UnavailableId(EndpointId),

    #[error("broker error {code}: {message}")]
    Broker { code: String, message: String },

    #[error("broker connection failed: {0}")]
    Network(String),

    #[error("link is not open")]
    LinkClosed,

    #[error("endpoint has been destroyed")]
    Destroyed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Raw error code, as a broker would report it.
    pub fn code(&self) -> &str {
        match self {
            Self::PeerUnavailable(_) => "peer-unavailable",
            Self::UnavailableId(_) => "unavailable-id",
            Self::Broker { code, .. } => code,
            Self::Network(_) => "network",
            Self::LinkClosed => "link-closed",
            Self::Destroyed => "destroyed",
            Self::Protocol(_) => "protocol",
        }
    }

    /// Map a broker-reported error code to a typed error.
    pub fn from_code(code: &str, message: &str, peer: Option<EndpointId>) -> Self {
        match (code, peer) {
            ("peer-unavailable", Some(peer)) => Self::PeerUnavailable(peer),
            ("unavailable-id", Some(peer)) => Self::UnavailableId(peer),
            (code, _) => Self::Broker {
                code: code.to_string(),
                message: message.to_string(),
            },
        }
    }
}
