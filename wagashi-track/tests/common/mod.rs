//! Minimal relay broker speaking the `BrokerFrame` protocol.
//!
//! Good enough to drive `WsBroker` end to end: ids are unique, links to
//! unknown ids fail with `peer-unavailable`, and a dropped connection
//! closes every link it was part of.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use wagashi_track::{BrokerFrame, EndpointId, LinkId};

#[derive(Default)]
struct RelayState {
    /// Leave the optional `peer` field out of ERROR frames.
    terse_errors: bool,
    clients: HashMap<EndpointId, mpsc::UnboundedSender<BrokerFrame>>,
    links: HashMap<LinkId, (EndpointId, EndpointId)>,
}

impl RelayState {
    fn send(&self, to: &EndpointId, frame: BrokerFrame) {
        if let Some(tx) = self.clients.get(to) {
            let _ = tx.send(frame);
        }
    }

    fn other_end(&self, link: &LinkId, from: &EndpointId) -> Option<EndpointId> {
        let (a, b) = self.links.get(link)?;
        if a == from {
            Some(b.clone())
        } else if b == from {
            Some(a.clone())
        } else {
            None
        }
    }
}

type Shared = Arc<Mutex<RelayState>>;

/// Start a relay on a free port and return its URL.
pub async fn start_relay() -> String {
    spawn_relay(false).await
}

/// Like [`start_relay`], but ERROR frames carry no `peer` field.
pub async fn start_terse_relay() -> String {
    spawn_relay(true).await
}

async fn spawn_relay(terse_errors: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let state: Shared = Arc::new(Mutex::new(RelayState {
        terse_errors,
        ..RelayState::default()
    }));

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, state.clone()));
        }
    });
    format!("ws://127.0.0.1:{port}")
}

async fn serve(stream: TcpStream, state: Shared) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<BrokerFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(message) = frame.to_message() else { continue };
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut me: Option<EndpointId> = None;
    while let Some(Ok(message)) = source.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<BrokerFrame>(text.as_str()) else {
            continue;
        };
        let mut relay = state.lock().await;
        match frame {
            BrokerFrame::Register { id } => {
                let id = id.unwrap_or_else(|| EndpointId::from(Uuid::new_v4().to_string()));
                if relay.clients.contains_key(&id) {
                    let _ = tx.send(BrokerFrame::Error {
                        code: "unavailable-id".into(),
                        message: format!("id {id} is taken"),
                        peer: (!relay.terse_errors).then_some(id),
                    });
                    continue;
                }
                relay.clients.insert(id.clone(), tx.clone());
                let _ = tx.send(BrokerFrame::Open { id: id.clone() });
                me = Some(id);
            }
            BrokerFrame::Connect { link, dst } => {
                let Some(src) = me.clone() else { continue };
                if !relay.clients.contains_key(&dst) {
                    let _ = tx.send(BrokerFrame::Error {
                        code: "peer-unavailable".into(),
                        message: format!("could not connect to peer {dst}"),
                        peer: (!relay.terse_errors).then_some(dst),
                    });
                    continue;
                }
                relay.links.insert(link, (src.clone(), dst.clone()));
                relay.send(&dst, BrokerFrame::Incoming { link, src: src.clone() });
                relay.send(&dst, BrokerFrame::LinkOpen { link });
                relay.send(&src, BrokerFrame::LinkOpen { link });
            }
            BrokerFrame::Data { link, payload } => {
                let Some(src) = me.as_ref() else { continue };
                if let Some(dst) = relay.other_end(&link, src) {
                    relay.send(&dst, BrokerFrame::Data { link, payload });
                }
            }
            BrokerFrame::Close { link } => {
                let Some(src) = me.as_ref() else { continue };
                if let Some(dst) = relay.other_end(&link, src) {
                    relay.links.remove(&link);
                    relay.send(&dst, BrokerFrame::Close { link });
                }
            }
            _ => {}
        }
    }

    if let Some(id) = me {
        let mut relay = state.lock().await;
        relay.clients.remove(&id);
        let owned: Vec<LinkId> = relay
            .links
            .iter()
            .filter(|(_, (a, b))| *a == id || *b == id)
            .map(|(link, _)| *link)
            .collect();
        for link in owned {
            if let Some(dst) = relay.other_end(&link, &id) {
                relay.send(&dst, BrokerFrame::Close { link });
            }
            relay.links.remove(&link);
        }
    }
    writer.abort();
}
