//! Driver-side fan-out to connected viewers.
//!
//! ```text
//!   IncomingLink ──► register ──► LinkOpen ──► SYNC_STATE to that link
//!                                     │
//!   broadcast(msg) ──encode once──► every open link
//!                                     │
//!   LinkClosed ──► deregister (viewer count drops)
//! ```
//!
//! The hub is owned by the session loop, so it takes `&mut self` and needs
//! no locking. Sends are fire-and-forget: a link that is registered but not
//! open (still connecting, or closing) is skipped without error, and a dead
//! link only leaves the set when the transport reports it closed.

use std::collections::HashMap;

use crate::protocol::{ProtocolError, ProtocolMessage, SyncSnapshot};
use crate::transport::{Link, LinkId};

/// Counters for monitoring fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Calls to [`BroadcastHub::broadcast`].
    pub broadcasts: u64,
    /// Individual link sends that were queued.
    pub deliveries: u64,
    /// Registered links skipped because they were not open.
    pub skipped: u64,
    pub viewers: usize,
}

/// The set of viewer links for one driver.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    links: HashMap<LinkId, Link>,
    stats: HubStats,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a viewer's link. Happens whether or not a delivery is running.
    pub fn register(&mut self, link: Link) {
        log::info!("Viewer {} connecting on link {}", link.remote(), link.id());
        self.links.insert(link.id(), link);
    }

    /// The link can carry data: catch the viewer up with a full snapshot.
    ///
    /// Returns `false` if the link is unknown to the hub.
    pub fn on_link_open(&mut self, id: LinkId, snapshot: &SyncSnapshot) -> bool {
        let Some(link) = self.links.get(&id) else {
            return false;
        };
        let message = ProtocolMessage::SyncState(snapshot.clone());
        match link.send(&message) {
            Ok(()) => log::debug!(
                "Sent SYNC_STATE ({} messages) to {}",
                snapshot.messages.len(),
                link.remote()
            ),
            Err(e) => log::warn!("Could not sync viewer {}: {e}", link.remote()),
        }
        true
    }

    /// Forget a closed link. Returns the link if it was registered.
    pub fn on_link_closed(&mut self, id: LinkId) -> Option<Link> {
        let link = self.links.remove(&id)?;
        log::info!("Viewer {} left ({} remaining)", link.remote(), self.links.len());
        Some(link)
    }

    /// Send `message` to every open link, encoding it once.
    ///
    /// Returns how many links it was queued on.
    pub fn broadcast(&mut self, message: &ProtocolMessage) -> Result<usize, ProtocolError> {
        let payload = message.encode()?;
        self.stats.broadcasts += 1;

        let mut sent = 0;
        for link in self.links.values() {
            if !link.is_open() {
                self.stats.skipped += 1;
                continue;
            }
            match link.send_raw(payload.clone()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    self.stats.skipped += 1;
                    log::debug!("Skipped {}: {e}", link.remote());
                }
            }
        }
        self.stats.deliveries += sent as u64;
        log::debug!("Broadcast {} to {sent} viewer(s)", message.tag());
        Ok(sent)
    }

    /// Registered (not yet closed) links.
    pub fn viewer_count(&self) -> usize {
        self.links.len()
    }

    pub fn contains(&self, id: &LinkId) -> bool {
        self.links.contains_key(id)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            viewers: self.links.len(),
            ..self.stats
        }
    }

    /// Close and forget every link.
    pub fn close_all(&mut self) {
        for (_, link) in self.links.drain() {
            link.close();
        }
    }
}
