//! WebSocket broker adapter.
//!
//! Talks to a relay-style connection broker over one WebSocket per local
//! endpoint. Frames are JSON objects tagged by `type`:
//!
//! ```text
//! client → broker   REGISTER { id? }         claim an id, or ask for one
//! broker → client   OPEN { id }              endpoint is live
//! broker → client   ERROR { code, message, peer? }
//! client → broker   CONNECT { link, dst }    start a link
//! broker → client   INCOMING { link, src }   someone linked to us
//! broker → both     LINK_OPEN { link }
//! both directions   DATA { link, payload }
//! both directions   CLOSE { link }
//! ```

use std::collections::HashMap;

use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};

use super::{Broker, Command, Endpoint, EndpointId, Link, LinkId, TransportError, TransportEvent, TransportEvents};

/// One frame on the broker WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerFrame {
    Register {
        #[serde(default)]
        id: Option<EndpointId>,
    },
    Open {
        id: EndpointId,
    },
    Error {
        code: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        peer: Option<EndpointId>,
    },
    Connect {
        link: LinkId,
        dst: EndpointId,
    },
    Incoming {
        link: LinkId,
        src: EndpointId,
    },
    LinkOpen {
        link: LinkId,
    },
    Data {
        link: LinkId,
        payload: String,
    },
    Close {
        link: LinkId,
    },
}

impl BrokerFrame {
    pub fn to_message(&self) -> Result<Message, serde_json::Error> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

/// Broker reached at a `ws://` or `wss://` URL.
#[derive(Debug, Clone)]
pub struct WsBroker {
    url: String,
}

impl WsBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Broker for WsBroker {
    fn open(&self, id_hint: Option<EndpointId>) -> (Endpoint, TransportEvents) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = BrokerSession {
            links: HashMap::new(),
            connecting: HashMap::new(),
            commands_tx: commands_tx.clone(),
            events: events_tx,
        };
        tokio::spawn(session.run(self.url.clone(), id_hint, commands_rx));
        (Endpoint::new(commands_tx), events_rx)
    }
}

/// State of one endpoint's broker connection.
struct BrokerSession {
    links: HashMap<LinkId, Link>,
    /// Outgoing links the broker has not opened yet.
    connecting: HashMap<LinkId, EndpointId>,
    commands_tx: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// What the connection loop should do after handling something.
enum Flow {
    Continue,
    Stop,
}

impl BrokerSession {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    async fn run(
        mut self,
        url: String,
        id_hint: Option<EndpointId>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                log::warn!("Could not reach broker at {url}: {e}");
                self.emit(TransportEvent::Error(TransportError::Network(e.to_string())));
                return;
            }
        };
        let (mut sink, mut stream) = ws.split();

        if let Err(e) = send_frame(&mut sink, &BrokerFrame::Register { id: id_hint }).await {
            self.emit(TransportEvent::Error(e));
            return;
        }

        loop {
            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command, &mut sink).await,
                    None => Flow::Stop,
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<BrokerFrame>(text.as_str()) {
                            Ok(frame) => self.handle_frame(frame),
                            Err(e) => {
                                log::warn!("Unreadable broker frame: {e}");
                                Flow::Continue
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        match sink.send(Message::Pong(data)).await {
                            Ok(()) => Flow::Continue,
                            Err(e) => self.lost(e.to_string()),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => self.lost("broker closed the connection".to_string()),
                    Some(Err(e)) => self.lost(e.to_string()),
                    Some(Ok(_)) => Flow::Continue,
                },
            };
            if let Flow::Stop = flow {
                break;
            }
        }

        for (id, link) in self.links.drain() {
            link.set_open(false);
            let _ = self.events.send(TransportEvent::LinkClosed(id));
        }
        let _ = sink.send(Message::Close(None)).await;
        log::debug!("Broker connection to {url} released");
    }

    fn lost(&self, reason: String) -> Flow {
        log::warn!("Broker connection lost: {reason}");
        self.emit(TransportEvent::Error(TransportError::Network(reason)));
        Flow::Stop
    }

    async fn handle_command<S>(&mut self, command: Command, sink: &mut S) -> Flow
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let frame = match command {
            Command::Connect(link) => self.begin_connect(link),
            Command::Send { link, payload } => BrokerFrame::Data { link, payload },
            Command::Close { link } => {
                self.connecting.remove(&link);
                if let Some(handle) = self.links.remove(&link) {
                    handle.set_open(false);
                    self.emit(TransportEvent::LinkClosed(link));
                }
                BrokerFrame::Close { link }
            }
            Command::Destroy => return Flow::Stop,
        };

        match send_frame(sink, &frame).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                self.emit(TransportEvent::Error(e));
                Flow::Stop
            }
        }
    }

    fn begin_connect(&mut self, link: Link) -> BrokerFrame {
        let frame = BrokerFrame::Connect {
            link: link.id(),
            dst: link.remote().clone(),
        };
        self.connecting.insert(link.id(), link.remote().clone());
        self.links.insert(link.id(), link);
        frame
    }

    /// Forget the pending links to `peer`, or every pending link when the
    /// broker did not say which peer failed. Returns the failed target.
    fn fail_connect(&mut self, peer: Option<&EndpointId>) -> Option<EndpointId> {
        let failed: Vec<(LinkId, EndpointId)> = self
            .connecting
            .iter()
            .filter(|(_, dst)| peer.is_none_or(|peer| *dst == peer))
            .map(|(link, dst)| (*link, dst.clone()))
            .collect();
        for (link, _) in &failed {
            self.connecting.remove(link);
            if let Some(handle) = self.links.remove(link) {
                handle.set_open(false);
            }
        }
        failed.into_iter().next().map(|(_, dst)| dst)
    }

    fn handle_frame(&mut self, frame: BrokerFrame) -> Flow {
        match frame {
            BrokerFrame::Open { id } => {
                log::info!("Broker opened endpoint {id}");
                self.emit(TransportEvent::Open(id));
            }
            BrokerFrame::Error { code, message, peer } => {
                log::warn!("Broker error {code}: {message}");
                let peer = if code == "peer-unavailable" {
                    let failed = self.fail_connect(peer.as_ref());
                    peer.or(failed)
                } else {
                    peer
                };
                self.emit(TransportEvent::Error(TransportError::from_code(&code, &message, peer)));
            }
            BrokerFrame::Incoming { link, src } => {
                let handle = Link::new(link, src, self.commands_tx.clone());
                self.links.insert(link, handle.clone());
                self.emit(TransportEvent::IncomingLink(handle));
            }
            BrokerFrame::LinkOpen { link } => {
                self.connecting.remove(&link);
                if let Some(handle) = self.links.get(&link) {
                    handle.set_open(true);
                    self.emit(TransportEvent::LinkOpen(link));
                }
            }
            BrokerFrame::Data { link, payload } => {
                if self.links.get(&link).is_some_and(Link::is_open) {
                    self.emit(TransportEvent::LinkData { link, payload });
                }
            }
            BrokerFrame::Close { link } => {
                self.connecting.remove(&link);
                if let Some(handle) = self.links.remove(&link) {
                    handle.set_open(false);
                    self.emit(TransportEvent::LinkClosed(link));
                }
            }
            BrokerFrame::Register { .. } | BrokerFrame::Connect { .. } => {
                log::debug!("Ignoring client-only frame from broker");
            }
        }
        Flow::Continue
    }
}

async fn send_frame<S>(sink: &mut S, frame: &BrokerFrame) -> Result<(), TransportError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let message = frame
        .to_message()
        .map_err(|e| TransportError::Protocol(crate::protocol::ProtocolError::Encode(e)))?;
    sink.send(message)
        .await
        .map_err(|e| TransportError::Network(e.to_string()))
}
