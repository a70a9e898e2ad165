//! Session manager: owns every piece of one tracker instance and runs its
//! single event loop.
//!
//! ```text
//!                  ┌────────────────────── session task ───────────────────────┐
//!  TransportEvent ─►                                                           │
//!  position fix ───►  TrackingStore ◄─┬─ BroadcastHub (driver)                 ├─► watch<SessionView>
//!  SessionCommand ─►                  └─ SyncClient   (customer)               ├─► mpsc<SessionEvent>
//!  status text ────►  GeolocationWatcher, Endpoint                             │
//!                  └───────────────────────────────────────────────────────────┘
//! ```
//!
//! All state is touched only from inside the task, so nothing is locked.
//! The role is fixed when the manager is built and cannot change. However
//! the loop ends (explicit shutdown, every handle dropped), the same
//! teardown runs: the geolocation subscription is released, all links are
//! closed, and the local endpoint is destroyed.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::geo::{GeoError, GeolocationWatcher, PositionSource};
use crate::hub::BroadcastHub;
use crate::identity::{generate_driver_id, share_link, Identity, Role};
use crate::protocol::{Coordinates, DeliveryMessage, MessageKind, ProtocolMessage};
use crate::status::{compose_status, PhraseGenerator, StatusContext, StatusGenerator};
use crate::store::{TrackingSession, TrackingStore};
use crate::sync::{SyncClient, SyncUpdate};
use crate::transport::{Broker, Endpoint, EndpointId, TransportError, TransportEvent, TransportEvents};

/// Timeline text when a delivery starts.
pub const DELIVERY_STARTED: &str = "Delivery started. Sharing location.";
/// Timeline text when a delivery stops.
pub const DELIVERY_COMPLETED: &str = "Delivery completed.";

/// Something the user should be told about. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// The delivery id in the link does not exist on the broker.
    DriverNotFound,
    /// Any other broker or link failure, with the raw code.
    Communication { code: String },
    /// A position fix failed; watching continues.
    Geolocation(GeoError),
    /// This platform has no location capability.
    GeolocationUnsupported,
}

impl Condition {
    pub fn from_transport(err: &TransportError) -> Self {
        match err.code() {
            "peer-unavailable" => Self::DriverNotFound,
            code => Self::Communication { code: code.to_string() },
        }
    }

    /// Cleared by the next successful position fix.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Geolocation(_))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DriverNotFound => f.write_str("Driver not found. Please check that the link is correct."),
            Self::Communication { code } => write!(f, "A communication error occurred: {code}"),
            Self::Geolocation(_) => f.write_str("Cannot get your location. Please check permissions."),
            Self::GeolocationUnsupported => f.write_str("Location is not supported on this device."),
        }
    }
}

/// Human-facing connection status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Initializing,
    /// Driver endpoint open, no delivery running.
    Standby,
    /// Customer endpoint open.
    Ready,
    Connecting,
    Connected,
    Broadcasting,
    /// The driver ended the delivery.
    Ended,
    Disconnected,
    ConnectionError,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initializing => "Initializing...",
            Self::Standby => "Standby",
            Self::Ready => "Ready to connect",
            Self::Connecting => "Connecting to driver...",
            Self::Connected => "Connected",
            Self::Broadcasting => "Broadcasting",
            Self::Ended => "Delivery ended",
            Self::Disconnected => "Disconnected",
            Self::ConnectionError => "Connection error",
        })
    }
}

/// One-shot notices, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The local endpoint is live under this id.
    Opened(EndpointId),
    ViewerJoined(EndpointId),
    ViewerLeft(EndpointId),
    Condition(Condition),
    /// Customer: the driver ended the delivery.
    DeliveryEnded,
    /// Customer: the link to the driver is gone. Terminal.
    Disconnected,
}

/// Read-only picture of the session, republished after every event.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub role: Role,
    pub coordinates: Option<Coordinates>,
    /// Newest first.
    pub messages: Vec<DeliveryMessage>,
    pub session: TrackingSession,
    pub viewer_count: usize,
    pub status: PeerStatus,
    pub condition: Option<Condition>,
    /// Whether the position source is subscribed.
    pub watching: bool,
    share_link: Option<String>,
}

impl SessionView {
    fn initial(role: Role) -> Self {
        Self {
            role,
            coordinates: None,
            messages: Vec::new(),
            session: TrackingSession::default(),
            viewer_count: 0,
            status: PeerStatus::Initializing,
            condition: None,
            watching: false,
            share_link: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_active
    }

    /// Driver: the link customers open, once the delivery id is known.
    pub fn share_link(&self) -> Option<&str> {
        self.share_link.as_deref()
    }
}

/// User actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    StartDelivery,
    StopDelivery,
    RequestStatusUpdate,
    Shutdown,
}

/// Builds and launches one session.
pub struct SessionManager<B, P, G = PhraseGenerator> {
    identity: Identity,
    config: TrackerConfig,
    broker: B,
    source: P,
    generator: Arc<G>,
    id_hint: Option<EndpointId>,
}

impl<B, P> SessionManager<B, P>
where
    B: Broker,
    P: PositionSource + Send + 'static,
{
    pub fn new(identity: Identity, config: TrackerConfig, broker: B, source: P) -> Self {
        Self {
            identity,
            config,
            broker,
            source,
            generator: Arc::new(PhraseGenerator),
            id_hint: None,
        }
    }
}

impl<B, P, G> SessionManager<B, P, G>
where
    B: Broker,
    P: PositionSource + Send + 'static,
    G: StatusGenerator,
{
    /// Use a different status text source.
    pub fn with_status_generator<H: StatusGenerator>(self, generator: H) -> SessionManager<B, P, H> {
        SessionManager {
            identity: self.identity,
            config: self.config,
            broker: self.broker,
            source: self.source,
            generator: Arc::new(generator),
            id_hint: self.id_hint,
        }
    }

    /// Driver: claim this id instead of a random one.
    pub fn with_endpoint_id(mut self, id: impl Into<EndpointId>) -> Self {
        self.id_hint = Some(id.into());
        self
    }

    pub fn role(&self) -> Role {
        self.identity.role()
    }

    /// Open the endpoint and start the event loop on the current runtime.
    pub fn spawn(self) -> SessionHandle {
        let role = self.identity.role();
        let (driver_state, id_hint) = match self.identity {
            Identity::Driver => {
                let id = self.id_hint.unwrap_or_else(|| {
                    generate_driver_id(&mut rand::thread_rng(), &self.config.id_prefix, self.config.id_suffix_len)
                });
                (RoleState::Driver(BroadcastHub::new()), Some(id))
            }
            Identity::Customer { target } => (RoleState::Customer(SyncClient::new(target)), None),
        };

        log::info!("Starting {role:?} session");
        let (endpoint, transport) = self.broker.open(id_hint);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(SessionView::initial(role));
        let (events_tx, events_rx) = mpsc::channel(self.config.event_capacity.max(1));

        let session = SessionLoop {
            role: driver_state,
            store: TrackingStore::new(),
            endpoint,
            watcher: GeolocationWatcher::new(self.source, self.config.geolocation.clone()),
            generator: self.generator,
            pending: JoinSet::new(),
            view: view_tx,
            events: events_tx,
            status: PeerStatus::Initializing,
            condition: None,
            share_link: None,
            config: self.config,
        };
        let task = tokio::spawn(session.run(transport, commands_rx));

        SessionHandle {
            role,
            commands: commands_tx,
            view: view_rx,
            events: Some(events_rx),
            task,
        }
    }
}

/// Control and observation handle for a running session.
///
/// Dropping the handle ends the session.
pub struct SessionHandle {
    role: Role,
    commands: mpsc::UnboundedSender<SessionCommand>,
    view: watch::Receiver<SessionView>,
    events: Option<mpsc::Receiver<SessionEvent>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn role(&self) -> Role {
        self.role
    }

    /// Driver: begin a delivery.
    pub fn start_delivery(&self) -> Result<()> {
        self.send(SessionCommand::StartDelivery)
    }

    /// Driver: end the running delivery.
    pub fn stop_delivery(&self) -> Result<()> {
        self.send(SessionCommand::StopDelivery)
    }

    /// Driver: generate and post a status line. Ignored while inactive.
    pub fn request_status_update(&self) -> Result<()> {
        self.send(SessionCommand::RequestStatusUpdate)
    }

    fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::SessionClosed)
    }

    /// Latest published view.
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Another receiver for view updates.
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    /// Wait until the view satisfies `predicate`.
    pub async fn wait_for(&mut self, predicate: impl FnMut(&SessionView) -> bool) -> Result<SessionView> {
        self.view
            .wait_for(predicate)
            .await
            .map(|view| view.clone())
            .map_err(|_| Error::SessionClosed)
    }

    /// The notice stream. Available once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.take()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// End the session and wait for teardown to finish.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(SessionCommand::Shutdown);
        self.task.await.map_err(|e| {
            log::error!("Session task failed: {e}");
            Error::SessionClosed
        })
    }
}

/// Role-specific half of the session, fixed at construction.
enum RoleState {
    Driver(BroadcastHub),
    Customer(SyncClient),
}

struct SessionLoop<P, G> {
    role: RoleState,
    config: TrackerConfig,
    store: TrackingStore,
    endpoint: Endpoint,
    watcher: GeolocationWatcher<P>,
    generator: Arc<G>,
    pending: JoinSet<String>,
    view: watch::Sender<SessionView>,
    events: mpsc::Sender<SessionEvent>,
    status: PeerStatus,
    condition: Option<Condition>,
    share_link: Option<String>,
}

impl<P, G> SessionLoop<P, G>
where
    P: PositionSource + Send + 'static,
    G: StatusGenerator,
{
    async fn run(mut self, mut transport: TransportEvents, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        let mut transport_live = true;
        loop {
            tokio::select! {
                event = transport.recv(), if transport_live => match event {
                    Some(event) => self.on_transport(event),
                    None => {
                        transport_live = false;
                        self.on_transport_gone();
                    }
                },
                fix = self.watcher.next_fix() => {
                    if let Some(fix) = fix {
                        self.on_fix(fix);
                    }
                }
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(done) = self.pending.join_next(), if !self.pending.is_empty() => match done {
                    Ok(text) => self.on_status_ready(text),
                    Err(e) if e.is_cancelled() => log::debug!("Status generation cancelled"),
                    Err(e) => log::warn!("Status generation task failed: {e}"),
                },
            }
            self.publish();
        }
        self.teardown();
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open(id) => self.on_open(id),
            TransportEvent::IncomingLink(link) => match &mut self.role {
                RoleState::Driver(hub) => {
                    let remote = link.remote().clone();
                    hub.register(link);
                    self.notify(SessionEvent::ViewerJoined(remote));
                }
                RoleState::Customer(sync) => sync.reject_incoming(&link),
            },
            TransportEvent::LinkOpen(id) => match &mut self.role {
                RoleState::Driver(hub) => {
                    hub.on_link_open(id, &self.store.snapshot());
                }
                RoleState::Customer(sync) => {
                    if sync.on_link_open(id, &mut self.store).is_some() {
                        self.status = PeerStatus::Connected;
                        self.condition = None;
                    }
                }
            },
            TransportEvent::LinkData { link, payload } => match &mut self.role {
                RoleState::Driver(_) => log::debug!("Ignoring data from viewer on link {link}"),
                RoleState::Customer(sync) => match sync.on_data(link, &payload, &mut self.store) {
                    Ok(Some(SyncUpdate::DeliveryEnded)) => {
                        log::info!("Driver ended the delivery");
                        self.status = PeerStatus::Ended;
                        self.notify(SessionEvent::DeliveryEnded);
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Dropping unreadable frame from driver: {e}"),
                },
            },
            TransportEvent::LinkClosed(id) => match &mut self.role {
                RoleState::Driver(hub) => {
                    if let Some(link) = hub.on_link_closed(id) {
                        self.notify(SessionEvent::ViewerLeft(link.remote().clone()));
                    }
                }
                RoleState::Customer(sync) => {
                    if sync.on_link_closed(id, &mut self.store).is_some() {
                        self.status = PeerStatus::Disconnected;
                        self.notify(SessionEvent::Disconnected);
                    }
                }
            },
            TransportEvent::Error(err) => self.on_transport_error(err),
        }
    }

    fn on_open(&mut self, id: EndpointId) {
        log::info!("Endpoint open as {id}");
        match &mut self.role {
            RoleState::Driver(_) => {
                self.store.set_delivery_id(id.as_str());
                self.share_link = Some(share_link(&self.config.share_base, &id));
                if !self.store.is_active() {
                    self.status = PeerStatus::Standby;
                }
            }
            RoleState::Customer(sync) => {
                self.status = PeerStatus::Ready;
                if sync.on_endpoint_open(&self.endpoint) {
                    self.status = PeerStatus::Connecting;
                }
            }
        }
        self.notify(SessionEvent::Opened(id));
    }

    fn on_transport_error(&mut self, err: TransportError) {
        log::warn!("Transport error: {err}");
        let condition = Condition::from_transport(&err);
        if matches!(err.code(), "peer-unavailable" | "unavailable-id") {
            self.status = PeerStatus::ConnectionError;
            if let RoleState::Customer(sync) = &mut self.role {
                sync.on_connect_failed();
            }
        }
        self.condition = Some(condition.clone());
        self.notify(SessionEvent::Condition(condition));
    }

    fn on_transport_gone(&mut self) {
        log::warn!("Transport event stream ended");
        if self.status != PeerStatus::ConnectionError {
            self.status = PeerStatus::Disconnected;
        }
    }

    fn on_fix(&mut self, fix: std::result::Result<Coordinates, GeoError>) {
        match fix {
            Ok(coords) => {
                self.store.set_coordinates(coords);
                if self.condition.as_ref().is_some_and(Condition::is_transient) {
                    self.condition = None;
                }
                self.broadcast(&ProtocolMessage::LocationUpdate(coords));
            }
            Err(e) => {
                log::warn!("Position fix failed: {e}");
                let condition = Condition::Geolocation(e);
                self.condition = Some(condition.clone());
                self.notify(SessionEvent::Condition(condition));
            }
        }
    }

    fn on_command(&mut self, command: SessionCommand) {
        if !matches!(self.role, RoleState::Driver(_)) {
            log::warn!("Ignoring {command:?}: only the driver controls a delivery");
            return;
        }
        match command {
            SessionCommand::StartDelivery => self.start_delivery(),
            SessionCommand::StopDelivery => self.stop_delivery(),
            SessionCommand::RequestStatusUpdate => self.request_status(),
            SessionCommand::Shutdown => {}
        }
    }

    fn start_delivery(&mut self) {
        if self.store.is_active() {
            log::debug!("Delivery already running");
            return;
        }
        self.store.start(Utc::now());
        log::info!("Delivery started");
        self.post(MessageKind::System, DELIVERY_STARTED);

        match self.watcher.start() {
            Ok(()) => self.status = PeerStatus::Broadcasting,
            Err(e) => {
                log::warn!("Cannot watch position: {e}");
                let condition = match e {
                    GeoError::Unsupported => Condition::GeolocationUnsupported,
                    other => Condition::Geolocation(other),
                };
                self.condition = Some(condition.clone());
                self.notify(SessionEvent::Condition(condition));
            }
        }
    }

    fn stop_delivery(&mut self) {
        if !self.store.is_active() {
            log::debug!("No delivery to stop");
            return;
        }
        self.store.deactivate();
        self.watcher.stop();
        self.pending.abort_all();
        self.status = PeerStatus::Standby;
        log::info!("Delivery completed");
        self.post(MessageKind::System, DELIVERY_COMPLETED);
        self.broadcast(&ProtocolMessage::SessionEnd);
    }

    fn request_status(&mut self) {
        if !self.store.is_active() {
            log::debug!("Status update requested while inactive; ignoring");
            return;
        }
        if !self.pending.is_empty() {
            log::debug!("Status update already in progress");
            return;
        }
        let context = StatusContext::random(&mut rand::thread_rng());
        log::debug!("Generating status near {}", context.location);
        let generator = self.generator.clone();
        let config = self.config.status.clone();
        self.pending
            .spawn(async move { compose_status(&*generator, context, &config).await });
    }

    fn on_status_ready(&mut self, text: String) {
        if !self.store.is_active() {
            log::debug!("Delivery ended before status was ready; dropping it");
            return;
        }
        self.post(MessageKind::Ai, text);
    }

    /// Record a timeline entry and send it to every viewer.
    fn post(&mut self, kind: MessageKind, text: impl Into<String>) {
        let message = self.store.record(kind, text, Utc::now());
        self.broadcast(&ProtocolMessage::MessageAdd(message));
    }

    fn broadcast(&mut self, message: &ProtocolMessage) {
        if let RoleState::Driver(hub) = &mut self.role {
            if let Err(e) = hub.broadcast(message) {
                log::warn!("Could not broadcast {}: {e}", message.tag());
            }
        }
    }

    fn notify(&self, event: SessionEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::debug!("Session notice dropped: {e}");
        }
    }

    fn publish(&self) {
        let viewer_count = match &self.role {
            RoleState::Driver(hub) => hub.viewer_count(),
            RoleState::Customer(_) => 0,
        };
        self.view.send_replace(SessionView {
            role: match self.role {
                RoleState::Driver(_) => Role::Driver,
                RoleState::Customer(_) => Role::Customer,
            },
            coordinates: self.store.coordinates(),
            messages: self.store.messages().to_vec(),
            session: self.store.session().clone(),
            viewer_count,
            status: self.status,
            condition: self.condition.clone(),
            watching: self.watcher.is_watching(),
            share_link: self.share_link.clone(),
        });
    }

    fn teardown(&mut self) {
        self.pending.abort_all();
        self.watcher.stop();
        match &mut self.role {
            RoleState::Driver(hub) => hub.close_all(),
            RoleState::Customer(sync) => sync.close(),
        }
        self.endpoint.destroy();
        self.publish();
        log::info!("Session torn down");
    }
}
