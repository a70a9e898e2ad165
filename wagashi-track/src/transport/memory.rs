//! In-process connection broker.
//!
//! Every endpoint opened on the same `MemoryBroker` (or a clone of it) can
//! link to every other one. Useful for tests and single-machine demos; it
//! follows the same rules a hosted broker enforces: ids are unique, links
//! to unknown ids fail with `peer-unavailable`, destroying an endpoint
//! closes all of its links.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::{Broker, Command, Endpoint, EndpointId, Link, LinkId, TransportError, TransportEvent, TransportEvents};

struct EndpointSlot {
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: mpsc::UnboundedSender<Command>,
}

struct LinkEntry {
    /// (owner endpoint, that owner's handle). Index 0 is the initiator.
    ends: [(EndpointId, Link); 2],
}

impl LinkEntry {
    fn other_end(&self, from: &EndpointId) -> Option<&(EndpointId, Link)> {
        if &self.ends[0].0 == from {
            Some(&self.ends[1])
        } else if &self.ends[1].0 == from {
            Some(&self.ends[0])
        } else {
            None
        }
    }
}

#[derive(Default)]
struct Registry {
    endpoints: HashMap<EndpointId, EndpointSlot>,
    links: HashMap<LinkId, LinkEntry>,
}

impl Registry {
    fn emit(&self, to: &EndpointId, event: TransportEvent) {
        if let Some(slot) = self.endpoints.get(to) {
            let _ = slot.events.send(event);
        }
    }

    fn connect(&mut self, from: &EndpointId, outgoing: Link) {
        let target = outgoing.remote().clone();
        let Some(slot) = self.endpoints.get(&target) else {
            log::debug!("{from} tried to link to unknown endpoint {target}");
            self.emit(from, TransportEvent::Error(TransportError::PeerUnavailable(target)));
            return;
        };

        let id = outgoing.id();
        let incoming = Link::new(id, from.clone(), slot.commands.clone());
        let _ = slot.events.send(TransportEvent::IncomingLink(incoming.clone()));

        incoming.set_open(true);
        outgoing.set_open(true);
        self.emit(&target, TransportEvent::LinkOpen(id));
        self.emit(from, TransportEvent::LinkOpen(id));

        log::debug!("Link {id} opened: {from} -> {target}");
        self.links.insert(
            id,
            LinkEntry {
                ends: [(from.clone(), outgoing), (target, incoming)],
            },
        );
    }

    fn deliver(&self, from: &EndpointId, link: LinkId, payload: String) {
        let Some((to, handle)) = self.links.get(&link).and_then(|e| e.other_end(from)) else {
            return;
        };
        if handle.is_open() {
            self.emit(to, TransportEvent::LinkData { link, payload });
        }
    }

    fn close_link(&mut self, link: LinkId) {
        if let Some(entry) = self.links.remove(&link) {
            for (owner, handle) in &entry.ends {
                handle.set_open(false);
                self.emit(owner, TransportEvent::LinkClosed(link));
            }
            log::debug!("Link {link} closed");
        }
    }

    fn remove_endpoint(&mut self, id: &EndpointId) {
        let owned: Vec<LinkId> = self
            .links
            .iter()
            .filter(|(_, entry)| entry.ends.iter().any(|(owner, _)| owner == id))
            .map(|(link, _)| *link)
            .collect();
        for link in owned {
            self.close_link(link);
        }
        self.endpoints.remove(id);
    }
}

/// In-process broker. Clones share one registry.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently registered endpoints.
    pub async fn endpoint_count(&self) -> usize {
        self.registry.lock().await.endpoints.len()
    }

    /// Number of currently open links.
    pub async fn link_count(&self) -> usize {
        self.registry.lock().await.links.len()
    }

    /// Whether `id` is registered.
    pub async fn is_registered(&self, id: &EndpointId) -> bool {
        self.registry.lock().await.endpoints.contains_key(id)
    }

    async fn run_endpoint(
        registry: Arc<Mutex<Registry>>,
        id_hint: Option<EndpointId>,
        commands_tx: mpsc::UnboundedSender<Command>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let id = id_hint.unwrap_or_else(|| EndpointId::from(Uuid::new_v4().to_string()));
        {
            let mut reg = registry.lock().await;
            if reg.endpoints.contains_key(&id) {
                log::warn!("Endpoint id {id} is already registered");
                let _ = events.send(TransportEvent::Error(TransportError::UnavailableId(id)));
                return;
            }
            reg.endpoints.insert(
                id.clone(),
                EndpointSlot {
                    events: events.clone(),
                    commands: commands_tx,
                },
            );
        }
        let _ = events.send(TransportEvent::Open(id.clone()));

        while let Some(command) = commands.recv().await {
            let mut reg = registry.lock().await;
            match command {
                Command::Connect(link) => reg.connect(&id, link),
                Command::Send { link, payload } => reg.deliver(&id, link, payload),
                Command::Close { link } => reg.close_link(link),
                Command::Destroy => break,
            }
        }

        registry.lock().await.remove_endpoint(&id);
        log::debug!("Endpoint {id} released");
    }
}

impl Broker for MemoryBroker {
    fn open(&self, id_hint: Option<EndpointId>) -> (Endpoint, TransportEvents) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run_endpoint(
            self.registry.clone(),
            id_hint,
            commands_tx.clone(),
            commands_rx,
            events_tx,
        ));
        (Endpoint::new(commands_tx), events_rx)
    }
}
