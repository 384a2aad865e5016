//! The communicator: one node's publish, search, listen and connect surface.
//!
//! A [`Communicator`] owns three independent activities (publishing our
//! descriptor, searching for peers, listening for inbound connections) and
//! the set of live [`Connection`]s. Every operation returns its outcome and
//! also publishes a [`CommunicatorEvent`], so applications may either await
//! results or follow the event stream.

use crate::codec::{CodecRegistry, Payload};
use crate::connection::{Connection, ConnectionContext, ConnectionEvent, StreamConnector, TcpConnector};
use crate::discovery::{DiscoveryError, DiscoveryEvent, DiscoveryHandle, DiscoveryTransport, Search};
use crate::frame::{FrameHeader, WireError};
use crate::registry::{ConnectionRegistry, DiscoveredPeer, PeerRegistry};
use communicate_types::{
    registered, ActivityState, CommunicateError, CommunicateResult, CommunicatorConfig,
    ConnectionState, DataKind, DnsTxtCodec, ErrorCode, ServiceDescriptor, TxtRecordCodec,
    TxtRecordSet,
};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Consecutive accept failures after which the listener is given up.
const MAX_ACCEPT_FAILURES: u32 = 5;

/// What a connection filter gets to decide on.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionRequest<'a> {
    /// The discovered service, for outbound connections.
    pub descriptor: Option<&'a ServiceDescriptor>,
    /// The remote socket, for inbound connections.
    pub remote_addr: Option<SocketAddr>,
}

/// Returns `true` to allow a connection.
pub type ConnectionFilter = Arc<dyn Fn(&ConnectionRequest<'_>) -> bool + Send + Sync>;

/// Notifications published by a communicator.
#[derive(Debug, Clone)]
pub enum CommunicatorEvent {
    PublishingStateChanged {
        state: ActivityState,
        error: Option<ErrorCode>,
    },
    SearchingStateChanged {
        state: ActivityState,
        error: Option<ErrorCode>,
    },
    ListeningStateChanged {
        state: ActivityState,
        error: Option<ErrorCode>,
    },
    /// Full snapshot of discovered services, ordered by first discovery.
    ServicesUpdated(Vec<ServiceDescriptor>),
    /// A peer connected to our listener.
    IncomingConnection(Connection),
    ConnectionStateChanged {
        connection: Connection,
        state: ConnectionState,
        error: Option<ErrorCode>,
    },
    TxtRecordsUpdated {
        connection: Connection,
        records: TxtRecordSet,
    },
}

#[derive(Debug, Clone, Copy)]
enum Activity {
    Publishing,
    Searching,
    Listening,
}

impl Activity {
    fn event(self, state: ActivityState, error: Option<ErrorCode>) -> CommunicatorEvent {
        match self {
            Activity::Publishing => CommunicatorEvent::PublishingStateChanged { state, error },
            Activity::Searching => CommunicatorEvent::SearchingStateChanged { state, error },
            Activity::Listening => CommunicatorEvent::ListeningStateChanged { state, error },
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ActivityStatus {
    state: ActivityState,
    error: Option<ErrorCode>,
}

#[derive(Debug, Default)]
struct Status {
    publishing: ActivityStatus,
    searching: ActivityStatus,
    listening: ActivityStatus,
    advertised: Option<ServiceDescriptor>,
    local_addr: Option<SocketAddr>,
}

impl Status {
    fn get_mut(&mut self, activity: Activity) -> &mut ActivityStatus {
        match activity {
            Activity::Publishing => &mut self.publishing,
            Activity::Searching => &mut self.searching,
            Activity::Listening => &mut self.listening,
        }
    }
}

/// Publish and search release their slot while the transport works.
/// `pending` marks an attempt in flight; stopping bumps `generation` so
/// the attempt, when it lands, knows it was withdrawn.
#[derive(Default)]
struct PublishSlot {
    handle: Option<DiscoveryHandle>,
    descriptor: Option<ServiceDescriptor>,
    txt: TxtRecordSet,
    pending: bool,
    generation: u64,
}

#[derive(Default)]
struct SearchSlot {
    handle: Option<DiscoveryHandle>,
    task: Option<JoinHandle<()>>,
    pending: bool,
    generation: u64,
}

#[derive(Default)]
struct ListenSlot {
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    config: CommunicatorConfig,
    transport: Arc<dyn DiscoveryTransport>,
    txt_codec: Arc<dyn TxtRecordCodec>,
    connector: Arc<dyn StreamConnector>,
    codecs: Arc<CodecRegistry>,
    peers: PeerRegistry,
    connections: ConnectionRegistry,
    events: broadcast::Sender<CommunicatorEvent>,
    status: RwLock<Status>,
    filter: RwLock<Option<ConnectionFilter>>,
    // Held only between awaits on the transport, never across them.
    publishing: tokio::sync::Mutex<PublishSlot>,
    searching: tokio::sync::Mutex<SearchSlot>,
    listening: tokio::sync::Mutex<ListenSlot>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(slot) = self.searching.try_lock() {
            if let Some(handle) = slot.handle {
                self.transport.stop_search(handle);
            }
            if let Some(task) = &slot.task {
                task.abort();
            }
        }
        if let Ok(slot) = self.publishing.try_lock() {
            if let Some(handle) = slot.handle {
                self.transport.unpublish(handle);
            }
        }
        if let Ok(slot) = self.listening.try_lock() {
            if let Some(task) = &slot.task {
                task.abort();
            }
        }
        // Tracking tasks only hold their connection; nothing else will close it.
        for connection in self.connections.drain() {
            connection.close();
        }
    }
}

/// Builder for a [`Communicator`].
pub struct CommunicatorBuilder {
    config: CommunicatorConfig,
    transport: Option<Arc<dyn DiscoveryTransport>>,
    txt_codec: Arc<dyn TxtRecordCodec>,
    connector: Arc<dyn StreamConnector>,
    codecs: Option<Arc<CodecRegistry>>,
}

impl CommunicatorBuilder {
    /// The discovery stack to publish, search and resolve with. Required.
    pub fn transport(mut self, transport: Arc<dyn DiscoveryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn txt_codec(mut self, txt_codec: Arc<dyn TxtRecordCodec>) -> Self {
        self.txt_codec = txt_codec;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Codec registry for every connection; defaults to the global one.
    pub fn codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    pub fn build(self) -> CommunicateResult<Communicator> {
        self.config.validate()?;
        let transport = self.transport.ok_or_else(|| {
            CommunicateError::InvalidInput("a discovery transport is required".into())
        })?;
        registered::init();
        let (events, _) = broadcast::channel(self.config.event_capacity);
        Ok(Communicator {
            inner: Arc::new(Inner {
                config: self.config,
                transport,
                txt_codec: self.txt_codec,
                connector: self.connector,
                codecs: self.codecs.unwrap_or_else(CodecRegistry::global),
                peers: PeerRegistry::new(),
                connections: ConnectionRegistry::new(),
                events,
                status: RwLock::new(Status::default()),
                filter: RwLock::new(None),
                publishing: tokio::sync::Mutex::new(PublishSlot::default()),
                searching: tokio::sync::Mutex::new(SearchSlot::default()),
                listening: tokio::sync::Mutex::new(ListenSlot::default()),
            }),
        })
    }
}

/// One node on the network. Clones share the same node.
#[derive(Clone)]
pub struct Communicator {
    inner: Arc<Inner>,
}

impl Communicator {
    pub fn builder(config: CommunicatorConfig) -> CommunicatorBuilder {
        CommunicatorBuilder {
            config,
            transport: None,
            txt_codec: Arc::new(DnsTxtCodec),
            connector: Arc::new(TcpConnector),
            codecs: None,
        }
    }

    /// A communicator with default codecs and plain TCP.
    pub fn new(
        config: CommunicatorConfig,
        transport: Arc<dyn DiscoveryTransport>,
    ) -> CommunicateResult<Self> {
        Self::builder(config).transport(transport).build()
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &CommunicatorConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CommunicatorEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: CommunicatorEvent) {
        let _ = self.inner.events.send(event);
    }

    fn status(&self) -> std::sync::RwLockReadGuard<'_, Status> {
        self.inner.status.read().unwrap_or_else(|e| e.into_inner())
    }

    fn status_mut(&self) -> std::sync::RwLockWriteGuard<'_, Status> {
        self.inner.status.write().unwrap_or_else(|e| e.into_inner())
    }

    fn set_activity(&self, activity: Activity, state: ActivityState, error: Option<ErrorCode>) {
        *self.status_mut().get_mut(activity) = ActivityStatus { state, error };
        self.emit(activity.event(state, error));
    }

    /// Re-announce the current state of an activity without changing it.
    fn repeat_activity(&self, activity: Activity) {
        let current = *self.status_mut().get_mut(activity);
        self.emit(activity.event(current.state, current.error));
    }

    pub fn publishing_state(&self) -> (ActivityState, Option<ErrorCode>) {
        let s = self.status().publishing;
        (s.state, s.error)
    }

    pub fn searching_state(&self) -> (ActivityState, Option<ErrorCode>) {
        let s = self.status().searching;
        (s.state, s.error)
    }

    pub fn listening_state(&self) -> (ActivityState, Option<ErrorCode>) {
        let s = self.status().listening;
        (s.state, s.error)
    }

    /// The descriptor currently published, if any.
    pub fn advertised(&self) -> Option<ServiceDescriptor> {
        self.status().advertised.clone()
    }

    /// Address of the listening socket while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.status().local_addr
    }

    /// Port announced to peers: the published port, else the listening
    /// port, else the configured one.
    fn advertised_port(&self) -> u16 {
        let status = self.status();
        status
            .advertised
            .as_ref()
            .map(ServiceDescriptor::port)
            .or_else(|| status.local_addr.map(|a| a.port()))
            .unwrap_or(self.inner.config.port)
    }

    // --- publishing -------------------------------------------------------

    /// Advertise `descriptor` with `txt`.
    ///
    /// While already published, or while a publish is in flight, this
    /// re-announces the current state and returns `Ok`. An [`unpublish`]
    /// issued before the transport answers withdraws the attempt, which then
    /// fails with `InvalidState`.
    ///
    /// [`unpublish`]: Communicator::unpublish
    pub async fn publish(&self, descriptor: ServiceDescriptor, txt: TxtRecordSet) -> CommunicateResult<()> {
        let (generation, blob) = {
            let mut slot = self.inner.publishing.lock().await;
            if slot.handle.is_some() || slot.pending {
                self.repeat_activity(Activity::Publishing);
                return Ok(());
            }
            let blob = self
                .inner
                .txt_codec
                .encode(&txt)
                .map_err(|e| CommunicateError::InvalidInput(e.to_string()))?;
            slot.pending = true;
            slot.generation += 1;
            self.set_activity(Activity::Publishing, ActivityState::Starting, None);
            (slot.generation, blob)
        };

        let result = self.inner.transport.publish(&descriptor, &blob).await;
        let mut slot = self.inner.publishing.lock().await;
        if !slot.pending || slot.generation != generation {
            if let Ok(handle) = result {
                self.inner.transport.unpublish(handle);
            }
            debug!(service = %descriptor, "Publish withdrawn before it completed");
            return Err(CommunicateError::InvalidState {
                current: self.publishing_state().0.to_string(),
                operation: "publish".into(),
            });
        }
        slot.pending = false;
        match result {
            Ok(handle) => {
                slot.handle = Some(handle);
                slot.descriptor = Some(descriptor.clone());
                slot.txt = txt;
                self.status_mut().advertised = Some(descriptor.clone());
                info!(service = %descriptor, "Publishing");
                self.set_activity(Activity::Publishing, ActivityState::Started, None);
                Ok(())
            }
            Err(e) => Err(self.activity_failed(Activity::Publishing, e.for_publishing(), &e)),
        }
    }

    /// Publish this node's own descriptor from the configuration.
    ///
    /// Uses the listening port when listening on an ephemeral port.
    pub async fn publish_self(&self, txt: TxtRecordSet) -> CommunicateResult<()> {
        let port = match self.local_addr() {
            Some(addr) => addr.port(),
            None => self.inner.config.port,
        };
        if port == 0 {
            return Err(CommunicateError::InvalidInput(
                "no port to advertise: start listening or configure a port".into(),
            ));
        }
        self.publish(self.inner.config.descriptor(port), txt).await
    }

    /// Withdraw the advertisement, or a publish still in flight. No-op when
    /// not published.
    pub async fn unpublish(&self) {
        let mut slot = self.inner.publishing.lock().await;
        if slot.pending {
            slot.pending = false;
            slot.generation += 1;
            info!("Publish cancelled");
            self.set_activity(Activity::Publishing, ActivityState::Stopped, None);
            return;
        }
        if let Some(handle) = slot.handle.take() {
            self.inner.transport.unpublish(handle);
            self.status_mut().advertised = None;
            info!("Unpublished");
            self.set_activity(Activity::Publishing, ActivityState::Stopped, None);
        }
    }

    /// Unpublish and publish the last descriptor and TXT records again.
    pub async fn republish(&self) -> CommunicateResult<()> {
        let (descriptor, txt) = {
            let slot = self.inner.publishing.lock().await;
            match &slot.descriptor {
                Some(descriptor) => (descriptor.clone(), slot.txt.clone()),
                None => {
                    return Err(CommunicateError::InvalidState {
                        current: self.publishing_state().0.to_string(),
                        operation: "republish".into(),
                    })
                }
            }
        };
        self.unpublish().await;
        self.publish(descriptor, txt).await
    }

    /// Replace the advertised TXT records, pushing them to the transport
    /// while published.
    pub async fn update_txt_records(&self, txt: TxtRecordSet) -> CommunicateResult<()> {
        let blob = self
            .inner
            .txt_codec
            .encode(&txt)
            .map_err(|e| CommunicateError::InvalidInput(e.to_string()))?;
        let handle = self.inner.publishing.lock().await.handle;
        if let Some(handle) = handle {
            self.inner
                .transport
                .update_metadata(handle, &blob)
                .await
                .map_err(|e| CommunicateError::operation(e.for_publishing(), e.to_string()))?;
            debug!(entries = txt.len(), "TXT records pushed");
        }
        self.inner.publishing.lock().await.txt = txt;
        Ok(())
    }

    /// The TXT records we advertise.
    pub async fn txt_records(&self) -> TxtRecordSet {
        self.inner.publishing.lock().await.txt.clone()
    }

    fn activity_failed(
        &self,
        activity: Activity,
        code: ErrorCode,
        reason: &dyn std::fmt::Display,
    ) -> CommunicateError {
        warn!(activity = ?activity, error = %code, reason = %reason, "Activity failed");
        self.set_activity(activity, ActivityState::Error, Some(code));
        CommunicateError::operation(code, reason.to_string())
    }

    // --- searching --------------------------------------------------------

    /// Browse for peers of the configured type and domain.
    ///
    /// Starting a new search clears the previous snapshot. A
    /// [`stop_searching`] issued before the transport answers withdraws the
    /// attempt, which then fails with `InvalidState`.
    ///
    /// [`stop_searching`]: Communicator::stop_searching
    pub async fn start_searching(&self) -> CommunicateResult<()> {
        let generation = {
            let mut slot = self.inner.searching.lock().await;
            if slot.handle.is_some() || slot.pending {
                self.repeat_activity(Activity::Searching);
                return Ok(());
            }
            if !self.inner.peers.is_empty() {
                self.inner.peers.clear();
                self.emit(CommunicatorEvent::ServicesUpdated(Vec::new()));
            }
            slot.pending = true;
            slot.generation += 1;
            self.set_activity(Activity::Searching, ActivityState::Starting, None);
            slot.generation
        };

        let config = &self.inner.config;
        let result = self
            .inner
            .transport
            .search(&config.service_type, &config.domain)
            .await;
        let mut slot = self.inner.searching.lock().await;
        if !slot.pending || slot.generation != generation {
            if let Ok(search) = result {
                self.inner.transport.stop_search(search.handle);
            }
            debug!("Search withdrawn before it started");
            return Err(CommunicateError::InvalidState {
                current: self.searching_state().0.to_string(),
                operation: "start_searching".into(),
            });
        }
        slot.pending = false;
        match result {
            Ok(Search { handle, events }) => {
                slot.handle = Some(handle);
                slot.task = Some(tokio::spawn(search_loop(
                    Arc::downgrade(&self.inner),
                    handle,
                    events,
                )));
                info!(service_type = %config.service_type, domain = %config.domain, "Searching");
                self.set_activity(Activity::Searching, ActivityState::Started, None);
                Ok(())
            }
            Err(e) => Err(self.activity_failed(Activity::Searching, e.for_searching(), &e)),
        }
    }

    /// Stop browsing, or withdraw a search still in flight. The last
    /// snapshot stays readable.
    pub async fn stop_searching(&self) {
        let mut slot = self.inner.searching.lock().await;
        if slot.pending {
            slot.pending = false;
            slot.generation += 1;
            info!("Search cancelled");
            self.set_activity(Activity::Searching, ActivityState::Stopped, None);
            return;
        }
        if let Some(handle) = slot.handle.take() {
            self.inner.transport.stop_search(handle);
            if let Some(task) = slot.task.take() {
                task.abort();
            }
            info!("Stopped searching");
            self.set_activity(Activity::Searching, ActivityState::Stopped, None);
        }
    }

    pub async fn restart_searching(&self) -> CommunicateResult<()> {
        self.stop_searching().await;
        self.start_searching().await
    }

    /// Discovered services ordered by first discovery.
    pub fn discovered_services(&self) -> Vec<ServiceDescriptor> {
        self.inner.peers.snapshot()
    }

    /// Discovered services with their discovery times.
    pub fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.inner.peers.entries()
    }

    fn is_own_service(&self, descriptor: &ServiceDescriptor) -> bool {
        self.inner.config.ignore_own_service
            && self.status().advertised.as_ref().is_some_and(|own| {
                own.full_name() == descriptor.full_name() && own.port() == descriptor.port()
            })
    }

    fn service_found(&self, descriptor: ServiceDescriptor) {
        if self.is_own_service(&descriptor) {
            debug!(service = %descriptor, "Ignoring own service");
            return;
        }
        let name = descriptor.to_string();
        if self.inner.peers.add(descriptor) {
            info!(service = %name, "Service found");
            self.emit(CommunicatorEvent::ServicesUpdated(self.inner.peers.snapshot()));
        }
    }

    fn service_lost(&self, descriptor: &ServiceDescriptor) {
        if self.inner.peers.remove(descriptor).is_some() {
            info!(service = %descriptor, "Service lost");
            self.emit(CommunicatorEvent::ServicesUpdated(self.inner.peers.snapshot()));
        }
    }

    async fn search_failed(&self, handle: DiscoveryHandle, error: DiscoveryError) {
        let mut slot = self.inner.searching.lock().await;
        if slot.handle != Some(handle) {
            return;
        }
        slot.handle = None;
        slot.task = None;
        self.activity_failed(Activity::Searching, error.for_searching(), &error);
    }

    // --- listening --------------------------------------------------------

    /// Open the listening endpoint and accept connections in the background.
    /// Returns the bound address; calling it again while listening returns
    /// the same address.
    pub async fn start_listening(&self) -> CommunicateResult<SocketAddr> {
        let mut slot = self.inner.listening.lock().await;
        if let Some(addr) = slot.local_addr {
            self.repeat_activity(Activity::Listening);
            return Ok(addr);
        }

        self.set_activity(Activity::Listening, ActivityState::Starting, None);
        let bind = self.inner.config.bind_addr();
        let listener = match TcpListener::bind(bind).await {
            Ok(listener) => listener,
            Err(e) => {
                let reason = format!("{bind}: {e}");
                return Err(self.activity_failed(
                    Activity::Listening,
                    ErrorCode::ListeningSocketCouldNotOpen,
                    &reason,
                ));
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                return Err(self.activity_failed(
                    Activity::Listening,
                    ErrorCode::ListeningUnknownError,
                    &e,
                ))
            }
        };

        slot.local_addr = Some(local_addr);
        slot.task = Some(tokio::spawn(accept_loop(Arc::downgrade(&self.inner), listener)));
        self.status_mut().local_addr = Some(local_addr);
        info!(addr = %local_addr, "Listening");
        self.set_activity(Activity::Listening, ActivityState::Started, None);
        Ok(local_addr)
    }

    /// Close the listening endpoint. Established connections stay open.
    pub async fn stop_listening(&self) {
        let mut slot = self.inner.listening.lock().await;
        if let Some(task) = slot.task.take() {
            task.abort();
            slot.local_addr = None;
            self.status_mut().local_addr = None;
            info!("Stopped listening");
            self.set_activity(Activity::Listening, ActivityState::Stopped, None);
        }
    }

    pub async fn restart_listening(&self) -> CommunicateResult<SocketAddr> {
        self.stop_listening().await;
        self.start_listening().await
    }

    async fn listener_closed(&self, reason: &std::io::Error) {
        let mut slot = self.inner.listening.lock().await;
        slot.task = None;
        slot.local_addr = None;
        self.status_mut().local_addr = None;
        self.activity_failed(Activity::Listening, ErrorCode::ListeningSocketClosed, reason);
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        let request = ConnectionRequest {
            descriptor: None,
            remote_addr: Some(addr),
        };
        if !self.allows(&request) {
            info!(peer = %addr, "Rejected incoming connection");
            return;
        }
        let connection = Connection::inbound(stream, self.connection_context());
        info!(peer = %addr, "Incoming connection");
        self.track(&connection);
        self.emit(CommunicatorEvent::IncomingConnection(connection));
    }

    // --- connections ------------------------------------------------------

    /// Install a predicate deciding which connections are allowed.
    pub fn set_connection_filter<F>(&self, filter: F)
    where
        F: Fn(&ConnectionRequest<'_>) -> bool + Send + Sync + 'static,
    {
        *self.inner.filter.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(filter));
    }

    pub fn clear_connection_filter(&self) {
        *self.inner.filter.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn allows(&self, request: &ConnectionRequest<'_>) -> bool {
        let filter = self
            .inner
            .filter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        filter.map_or(true, |f| f(request))
    }

    fn connection_context(&self) -> ConnectionContext {
        ConnectionContext::from_config(&self.inner.config, self.advertised_port())
            .with_transport(Arc::clone(&self.inner.transport))
            .with_codecs(Arc::clone(&self.inner.codecs))
            .with_connector(Arc::clone(&self.inner.connector))
            .with_txt_codec(Arc::clone(&self.inner.txt_codec))
    }

    /// Connect to a discovered service.
    ///
    /// Returns immediately; the connection resolves and connects in the
    /// background and reports through its state. A live connection to the
    /// same `(name, port)` is returned instead of opening a second one.
    pub fn connect_to(&self, descriptor: &ServiceDescriptor) -> Connection {
        if let Some(existing) = self.inner.connections.find(&descriptor.identity()) {
            debug!(service = %descriptor, "Reusing existing connection");
            return existing;
        }
        let connection = Connection::outbound(descriptor.clone(), self.connection_context());
        let request = ConnectionRequest {
            descriptor: Some(descriptor),
            remote_addr: None,
        };
        if !self.allows(&request) {
            connection.reject("refused by connection filter");
            return connection;
        }
        self.track(&connection);
        connection.start();
        connection
    }

    /// Live connections, inbound and outbound.
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.connections.all()
    }

    /// Send to every connected peer, returning the peers that failed.
    pub async fn send_to_all(&self, kind: DataKind, payload: &Payload) -> Vec<(Connection, WireError)> {
        let mut errors = Vec::new();
        for connection in self.inner.connections.connected() {
            if let Err(e) = connection.send(kind.clone(), payload, FrameHeader::new()).await {
                errors.push((connection, e));
            }
        }
        errors
    }

    /// Follow a connection's events until it ends, forwarding them as
    /// communicator events, then forget it.
    fn track(&self, connection: &Connection) {
        self.inner.connections.add(connection.clone());
        let mut events = connection.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let connection = connection.clone();

        tokio::spawn(async move {
            // Ended before we subscribed.
            if connection.state().is_terminal() && events.is_empty() {
                if let Some(communicator) = Communicator::upgrade(&weak) {
                    communicator.emit(CommunicatorEvent::ConnectionStateChanged {
                        connection: connection.clone(),
                        state: connection.state(),
                        error: connection.last_error(),
                    });
                    communicator.inner.connections.remove(&connection);
                }
                return;
            }
            loop {
                let event = match events.recv().await {
                    Ok(event) => Some(event),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(connection = %connection, skipped, "Connection events lagged");
                        None
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(communicator) = Communicator::upgrade(&weak) else {
                    break;
                };
                match event {
                    Some(ConnectionEvent::StateChanged { state, error }) => {
                        communicator.emit(CommunicatorEvent::ConnectionStateChanged {
                            connection: connection.clone(),
                            state,
                            error,
                        });
                    }
                    Some(ConnectionEvent::TxtRecordsUpdated(records)) => {
                        communicator.emit(CommunicatorEvent::TxtRecordsUpdated {
                            connection: connection.clone(),
                            records,
                        });
                    }
                    _ => {}
                }
                if connection.state().is_terminal() {
                    communicator.inner.connections.remove(&connection);
                    break;
                }
            }
        });
    }

    /// Unpublish, stop searching and listening, and close every connection.
    pub async fn stop(&self) {
        self.stop_searching().await;
        self.unpublish().await;
        self.stop_listening().await;
        for connection in self.inner.connections.drain() {
            connection.close();
        }
        info!(name = %self.inner.config.name, "Communicator stopped");
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("name", &self.inner.config.name)
            .field("publishing", &self.publishing_state())
            .field("searching", &self.searching_state())
            .field("listening", &self.listening_state())
            .field("connections", &self.inner.connections.len())
            .finish()
    }
}

async fn search_loop(
    weak: Weak<Inner>,
    handle: DiscoveryHandle,
    mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(communicator) = Communicator::upgrade(&weak) else {
            break;
        };
        match event {
            DiscoveryEvent::Added(descriptor) => communicator.service_found(descriptor),
            DiscoveryEvent::Removed(descriptor) => communicator.service_lost(&descriptor),
            DiscoveryEvent::Failed(error) => {
                communicator.search_failed(handle, error).await;
                break;
            }
        }
    }
}

async fn accept_loop(weak: Weak<Inner>, listener: TcpListener) {
    let mut failures = 0;
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                failures = 0;
                let Some(communicator) = Communicator::upgrade(&weak) else {
                    break;
                };
                debug!(peer = %addr, "Accepted connection");
                communicator.accept(stream, addr);
            }
            Err(e) if is_per_connection(&e) => {
                debug!(error = %e, "Accept aborted by peer");
            }
            Err(e) => {
                failures += 1;
                error!(error = %e, failures, "Accept error");
                if failures >= MAX_ACCEPT_FAILURES {
                    if let Some(communicator) = Communicator::upgrade(&weak) {
                        communicator.listener_closed(&e).await;
                    }
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Accept errors caused by one peer rather than the listening socket.
fn is_per_connection(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    )
}
