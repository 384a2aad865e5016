//! Peer connections.
//!
//! A [`Connection`] is one link to one peer. Outbound connections start from
//! a discovered [`ServiceDescriptor`] and walk the state machine
//! `Unresolved -> Resolving -> Resolved -> Connecting -> Connected`; inbound
//! connections are handed over by the listener already `Connected`.
//!
//! Once connected, a writer task owns the write half and sends frames one
//! at a time in submission order, and a reader task owns the read half and
//! pushes decoded frames into an inbox the application drains with
//! [`Connection::recv`]. State changes, progress and TXT updates are
//! broadcast as [`ConnectionEvent`]s.

use crate::codec::{CodecError, CodecRegistry, FilePayload, Payload};
use crate::discovery::{DiscoveryHandle, DiscoveryTransport, MetadataMonitor};
use crate::frame::{self, DataFrame, FrameHeader, FrameLimits, WireError, NAME_KEY};
use async_trait::async_trait;
use communicate_types::{
    ActionState, CommunicateError, CommunicateResult, CommunicatorConfig, ConnectionInformation,
    ConnectionState, DataComponent, DataKind, DnsTxtCodec, ErrorCode, PeerIdentity,
    ServiceDescriptor, TransferProgress, TxtRecordCodec, TxtRecordSet,
};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Frames that may wait for the writer before `send` applies backpressure.
const OUTBOX_CAPACITY: usize = 32;

/// Opens the byte stream for an outbound connection.
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<TcpStream>;
}

/// Plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl StreamConnector for TcpConnector {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }
}

/// Everything a connection needs from its owner.
#[derive(Clone)]
pub struct ConnectionContext {
    pub resolve_timeout: Duration,
    pub limits: FrameLimits,
    pub event_capacity: usize,
    /// Sent to the peer as soon as the connection opens.
    pub local_information: ConnectionInformation,
    pub codecs: Arc<CodecRegistry>,
    /// Used to resolve outbound peers and watch their TXT records.
    pub transport: Option<Arc<dyn DiscoveryTransport>>,
    pub txt_codec: Arc<dyn TxtRecordCodec>,
    pub connector: Arc<dyn StreamConnector>,
}

impl ConnectionContext {
    /// Settings from `config`; `advertised_port` is the port we tell peers.
    pub fn from_config(config: &CommunicatorConfig, advertised_port: u16) -> Self {
        Self {
            resolve_timeout: config.resolve_timeout(),
            limits: FrameLimits {
                max_component_bytes: config.max_frame_bytes,
                progress_percentage: config.progress_percentage,
            },
            event_capacity: config.event_capacity.max(1),
            local_information: ConnectionInformation::local(config.name.clone(), advertised_port),
            codecs: CodecRegistry::global(),
            transport: None,
            txt_codec: Arc::new(DnsTxtCodec),
            connector: Arc::new(TcpConnector),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn DiscoveryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_txt_codec(mut self, txt_codec: Arc<dyn TxtRecordCodec>) -> Self {
        self.txt_codec = txt_codec;
        self
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("resolve_timeout", &self.resolve_timeout)
            .field("limits", &self.limits)
            .field("event_capacity", &self.event_capacity)
            .field("local_information", &self.local_information)
            .field("has_transport", &self.transport.is_some())
            .finish()
    }
}

/// Notifications published by a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged {
        state: ConnectionState,
        /// Set when the change was caused by a failure.
        error: Option<ErrorCode>,
    },
    Sending(TransferProgress),
    Receiving(TransferProgress),
    /// The peer announced its name, port, version and platform.
    InformationReceived(ConnectionInformation),
    TxtRecordsUpdated(TxtRecordSet),
}

/// A frame received and decoded for the application.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedData {
    pub header: FrameHeader,
    pub kind: DataKind,
    pub payload: Payload,
    pub footer: FrameHeader,
}

impl ReceivedData {
    pub fn name(&self) -> &str {
        self.header.name().unwrap_or_default()
    }

    /// Payload size in bytes as declared by the sender.
    pub fn length(&self) -> u64 {
        self.header.length().unwrap_or_default()
    }
}

/// A frame that arrived intact but whose payload could not be decoded.
///
/// Delivered in place of the value; the connection stays open.
#[derive(Debug, Error)]
#[error("Failed to decode '{name}' as {kind}: {source}")]
pub struct DecodeFailure {
    pub name: String,
    pub kind: DataKind,
    #[source]
    pub source: CodecError,
}

/// One item from [`Connection::recv`].
pub type Inbound = Result<ReceivedData, DecodeFailure>;

struct SendJob {
    frame: DataFrame,
    done: oneshot::Sender<Result<(), WireError>>,
}

struct Inner {
    id: Uuid,
    descriptor: Option<ServiceDescriptor>,
    context: ConnectionContext,
    state: watch::Sender<ConnectionState>,
    last_error: Mutex<Option<ErrorCode>>,
    events: broadcast::Sender<ConnectionEvent>,
    remote_addr: Mutex<Option<SocketAddr>>,
    remote_information: RwLock<Option<ConnectionInformation>>,
    txt_records: RwLock<TxtRecordSet>,
    outbox: Mutex<Option<mpsc::Sender<SendJob>>>,
    inbox_tx: Mutex<Option<mpsc::Sender<Inbound>>>,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    monitor_handle: Mutex<Option<DiscoveryHandle>>,
}

impl Inner {
    fn stop_monitor(&self) {
        if let Some(task) = lock(&self.monitor_task).take() {
            task.abort();
        }
        if let Some(handle) = lock(&self.monitor_handle).take() {
            if let Some(transport) = &self.context.transport {
                transport.stop_monitor(handle);
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        self.stop_monitor();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to one peer connection. Clones share the same connection.
///
/// Two handles compare equal when they refer to the same peer: the same
/// advertised `(name, port)`, or for inbound connections the identity the
/// peer announced. Handles with no identity yet compare by instance.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    fn with_state(
        descriptor: Option<ServiceDescriptor>,
        context: ConnectionContext,
        initial: ConnectionState,
    ) -> Self {
        let (state, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(context.event_capacity.max(1));
        let (inbox_tx, inbox) = mpsc::channel(context.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                descriptor,
                context,
                state,
                last_error: Mutex::new(None),
                events,
                remote_addr: Mutex::new(None),
                remote_information: RwLock::new(None),
                txt_records: RwLock::new(TxtRecordSet::new()),
                outbox: Mutex::new(None),
                inbox_tx: Mutex::new(Some(inbox_tx)),
                inbox: tokio::sync::Mutex::new(inbox),
                reader: Mutex::new(None),
                monitor_task: Mutex::new(None),
                monitor_handle: Mutex::new(None),
            }),
        }
    }

    /// A connection to a discovered service, not yet resolved.
    pub fn outbound(descriptor: ServiceDescriptor, context: ConnectionContext) -> Self {
        Self::with_state(Some(descriptor), context, ConnectionState::Unresolved)
    }

    /// Adopt a stream accepted by a listener. Must be called inside a Tokio
    /// runtime; the connection starts `Connected`.
    pub fn inbound(stream: TcpStream, context: ConnectionContext) -> Self {
        let connection = Self::with_state(None, context, ConnectionState::Connected);
        connection.attach(stream);
        connection.announce();
        connection
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Unique per instance, independent of the peer.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// The failure that moved this connection to a terminal state, if any.
    pub fn last_error(&self) -> Option<ErrorCode> {
        *lock(&self.inner.last_error)
    }

    /// The descriptor this connection was created from (outbound only).
    pub fn descriptor(&self) -> Option<&ServiceDescriptor> {
        self.inner.descriptor.as_ref()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.remote_addr)
    }

    /// What the peer announced about itself, once received.
    pub fn remote_information(&self) -> Option<ConnectionInformation> {
        self.inner
            .remote_information
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Latest TXT records of the peer's advertisement.
    pub fn txt_records(&self) -> TxtRecordSet {
        self.inner
            .txt_records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The peer's `(name, port)` identity, when known.
    pub fn identity(&self) -> Option<PeerIdentity> {
        if let Some(descriptor) = &self.inner.descriptor {
            return Some(descriptor.identity());
        }
        self.remote_information().map(|info| info.identity())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until `pred` holds for the current state and return that state.
    pub async fn wait_for(&self, mut pred: impl FnMut(ConnectionState) -> bool) -> ConnectionState {
        let mut rx = self.inner.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if pred(current) {
                return current;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    /// Wait for `Connected`, failing if the connection ends first.
    pub async fn wait_connected(&self) -> CommunicateResult<()> {
        let state = self
            .wait_for(|s| s == ConnectionState::Connected || s.is_terminal())
            .await;
        if state == ConnectionState::Connected {
            return Ok(());
        }
        Err(CommunicateError::operation(
            self.last_error().unwrap_or(ErrorCode::ConnectionClosed),
            format!("connection is {state}"),
        ))
    }

    /// Move to `next` if the state machine allows it. The state change and
    /// its event are published under the same lock so observers see
    /// transitions in order.
    fn transition(&self, next: ConnectionState, error: Option<ErrorCode>) -> bool {
        let applied = self.inner.state.send_if_modified(|current| {
            if !current.can_transition_to(next) {
                return false;
            }
            *current = next;
            if error.is_some() {
                *lock(&self.inner.last_error) = error;
            }
            let _ = self
                .inner
                .events
                .send(ConnectionEvent::StateChanged { state: next, error });
            true
        });
        if applied {
            debug!(connection = %self, state = %next, "Connection state changed");
        }
        applied
    }

    /// Terminal failure. `ConnectionClosed` ends in `Closed`; every other
    /// code ends in `Failed`.
    fn fail(&self, code: ErrorCode, reason: &dyn fmt::Display) {
        let state = if code == ErrorCode::ConnectionClosed {
            ConnectionState::Closed
        } else {
            ConnectionState::Failed
        };
        if self.transition(state, Some(code)) {
            warn!(connection = %self, error = %code, reason = %reason, "Connection ended");
        }
        self.teardown();
    }

    pub(crate) fn reject(&self, reason: &str) {
        self.fail(ErrorCode::ConnectionRejected, &reason);
    }

    fn invalid_state(&self, operation: &str) -> CommunicateError {
        CommunicateError::InvalidState {
            current: self.state().to_string(),
            operation: operation.to_string(),
        }
    }

    fn closed_error(&self) -> CommunicateError {
        CommunicateError::operation(
            self.last_error().unwrap_or(ErrorCode::ConnectionClosed),
            format!("connection is {}", self.state()),
        )
    }

    /// Resolve and then connect in the background using the context's
    /// resolve timeout. Must be called inside a Tokio runtime.
    pub fn start(&self) {
        let connection = self.clone();
        let timeout = self.inner.context.resolve_timeout;
        tokio::spawn(async move {
            if let Err(e) = connection.resolve(timeout).await {
                debug!(connection = %connection, error = %e, "Connection establishment ended");
            }
        });
    }

    /// Resolve the descriptor to an address, then connect.
    ///
    /// Valid only from `Unresolved`. A resolution that does not finish
    /// within `timeout` fails the connection with `ResolvingTimedOut`.
    pub async fn resolve(&self, timeout: Duration) -> CommunicateResult<()> {
        let descriptor = self
            .inner
            .descriptor
            .clone()
            .ok_or_else(|| self.invalid_state("resolve"))?;
        let transport = self.inner.context.transport.clone().ok_or_else(|| {
            CommunicateError::InvalidInput("no discovery transport to resolve with".into())
        })?;
        if self.state() != ConnectionState::Unresolved
            || !self.transition(ConnectionState::Resolving, None)
        {
            return Err(self.invalid_state("resolve"));
        }

        debug!(connection = %self, service = %descriptor, "Resolving");
        let addr = match tokio::time::timeout(timeout, transport.resolve(&descriptor, timeout)).await
        {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => {
                let code = e.for_resolving();
                self.fail(code, &e);
                return Err(CommunicateError::operation(code, e.to_string()));
            }
            Err(_) => {
                let code = ErrorCode::ResolvingTimedOut;
                self.fail(code, &"resolution timed out");
                return Err(CommunicateError::operation(
                    code,
                    format!("no answer within {timeout:?}"),
                ));
            }
        };

        *lock(&self.inner.remote_addr) = Some(addr);
        if !self.transition(ConnectionState::Resolved, None) {
            return Err(self.closed_error());
        }
        info!(connection = %self, addr = %addr, "Resolved");
        self.connect().await
    }

    /// Open the stream to the resolved address. Valid only from `Resolved`.
    pub async fn connect(&self) -> CommunicateResult<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(self.closed_error());
        }
        if state != ConnectionState::Resolved {
            return Err(self.invalid_state("connect"));
        }
        let addr = (*lock(&self.inner.remote_addr)).ok_or_else(|| self.invalid_state("connect"))?;
        if !self.transition(ConnectionState::Connecting, None) {
            return Err(self.closed_error());
        }

        match self.inner.context.connector.connect(addr).await {
            Ok(stream) => {
                if self.state() != ConnectionState::Connecting {
                    return Err(self.closed_error());
                }
                self.attach(stream);
                if !self.transition(ConnectionState::Connected, None) {
                    self.teardown();
                    return Err(self.closed_error());
                }
                info!(connection = %self, addr = %addr, "Connected");
                self.announce();
                self.start_monitor();
                Ok(())
            }
            Err(e) => {
                let code = match e.kind() {
                    std::io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRejected,
                    _ => ErrorCode::ConnectionSocketCreationError,
                };
                self.fail(code, &e);
                Err(CommunicateError::operation(code, e.to_string()))
            }
        }
    }

    /// Split the stream and start the reader and writer tasks.
    fn attach(&self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle");
        }
        if let Ok(addr) = stream.peer_addr() {
            lock(&self.inner.remote_addr).get_or_insert(addr);
        }
        let (reader, writer) = stream.into_split();
        let weak = Arc::downgrade(&self.inner);

        let (tx, jobs) = mpsc::channel(OUTBOX_CAPACITY);
        *lock(&self.inner.outbox) = Some(tx);
        tokio::spawn(write_loop(
            weak.clone(),
            self.inner.events.clone(),
            self.inner.context.limits.progress_percentage,
            writer,
            jobs,
        ));

        if let Some(inbox) = lock(&self.inner.inbox_tx).take() {
            let task = tokio::spawn(read_loop(
                weak,
                self.inner.events.clone(),
                self.inner.context.limits,
                Arc::clone(&self.inner.context.codecs),
                reader,
                inbox,
            ));
            *lock(&self.inner.reader) = Some(task);
        }
    }

    /// Queue our connection information as the first frame.
    fn announce(&self) {
        let payload = match serde_json::to_vec(&self.inner.context.local_information) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(connection = %self, error = %e, "Could not encode connection information");
                return;
            }
        };
        let frame = DataFrame::new(DataKind::CONNECTION_INFORMATION, FrameHeader::new(), payload);
        let (done, _) = oneshot::channel();
        if let Some(tx) = lock(&self.inner.outbox).as_ref() {
            if tx.try_send(SendJob { frame, done }).is_err() {
                warn!(connection = %self, "Could not queue connection information");
            }
        }
    }

    fn receive_information(&self, frame: &DataFrame) {
        let info: ConnectionInformation = match serde_json::from_slice(&frame.payload) {
            Ok(info) => info,
            Err(e) => {
                warn!(connection = %self, error = %e, "Ignoring malformed connection information");
                return;
            }
        };
        if !info.is_compatible() {
            warn!(
                connection = %self,
                version = %info.version,
                "Peer speaks a different protocol version"
            );
        }
        info!(
            connection = %self,
            peer = %info.identity(),
            platform = %info.platform,
            "Peer information received"
        );
        *self
            .inner
            .remote_information
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(info.clone());
        let _ = self.inner.events.send(ConnectionEvent::InformationReceived(info));
    }

    /// Watch the peer's TXT records through the discovery transport.
    fn start_monitor(&self) {
        let (Some(transport), Some(descriptor)) = (
            self.inner.context.transport.clone(),
            self.inner.descriptor.clone(),
        ) else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let MetadataMonitor {
                handle,
                mut updates,
            } = match transport.monitor_metadata(&descriptor).await {
                Ok(monitor) => monitor,
                Err(e) => {
                    debug!(service = %descriptor, error = %e, "TXT monitoring unavailable");
                    return;
                }
            };
            match Connection::upgrade(&weak) {
                Some(connection) if !connection.state().is_terminal() => {
                    *lock(&connection.inner.monitor_handle) = Some(handle);
                    // Closed while we were registering.
                    if connection.state().is_terminal() {
                        connection.inner.stop_monitor();
                        return;
                    }
                }
                _ => {
                    transport.stop_monitor(handle);
                    return;
                }
            }
            while let Some(blob) = updates.recv().await {
                let Some(connection) = Connection::upgrade(&weak) else {
                    break;
                };
                connection.apply_txt_records(&blob);
            }
        });
        *lock(&self.inner.monitor_task) = Some(task);
    }

    fn apply_txt_records(&self, blob: &[u8]) {
        let records = self.inner.context.txt_codec.decode(blob);
        debug!(connection = %self, entries = records.len(), "TXT records updated");
        *self
            .inner
            .txt_records
            .write()
            .unwrap_or_else(|e| e.into_inner()) = records.clone();
        let _ = self.inner.events.send(ConnectionEvent::TxtRecordsUpdated(records));
    }

    fn ensure_connected(&self) -> Result<(), WireError> {
        if self.state() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(WireError::ConnectionClosed)
        }
    }

    /// Encode `payload` as `kind` and send it.
    ///
    /// `header` entries are carried to the peer; `Name`, `Length` and `Kind`
    /// are filled in. Resolves once the whole frame is written.
    pub async fn send(
        &self,
        kind: DataKind,
        payload: &Payload,
        header: FrameHeader,
    ) -> Result<(), WireError> {
        self.ensure_connected()?;
        let mut header = header;
        let bytes = self.inner.context.codecs.encode(&kind, payload, &mut header)?;
        self.send_frame(DataFrame::new(kind, header, bytes)).await
    }

    /// Send a pre-built frame, for example one carrying a footer.
    ///
    /// Control kinds are reserved for the connection and fail with
    /// [`WireError::ReservedKind`].
    pub async fn send_frame(&self, frame: DataFrame) -> Result<(), WireError> {
        if frame.kind.is_control() {
            return Err(WireError::ReservedKind(frame.kind));
        }
        self.enqueue(frame).await
    }

    /// Queue a frame for the writer and wait until it is on the wire.
    async fn enqueue(&self, frame: DataFrame) -> Result<(), WireError> {
        self.ensure_connected()?;
        let tx = lock(&self.inner.outbox)
            .clone()
            .ok_or(WireError::ConnectionClosed)?;
        let (done, result) = oneshot::channel();
        tx.send(SendJob { frame, done })
            .await
            .map_err(|_| WireError::ConnectionClosed)?;
        result.await.map_err(|_| WireError::ConnectionClosed)?
    }

    /// Send a payload as its default kind.
    pub async fn send_payload(&self, payload: &Payload) -> Result<(), WireError> {
        self.send(payload.default_kind(), payload, FrameHeader::new())
            .await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), WireError> {
        self.send_payload(&Payload::Text(text.into())).await
    }

    pub async fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), WireError> {
        self.send_payload(&Payload::Bytes(bytes)).await
    }

    /// Send a serializable value as a JSON object.
    pub async fn send_object<T: Serialize>(&self, value: &T) -> Result<(), WireError> {
        self.send(DataKind::JSON_OBJECT, &Payload::object(value)?, FrameHeader::new())
            .await
    }

    /// Send a serializable value as a MessagePack object.
    pub async fn send_binary_object<T: Serialize>(&self, value: &T) -> Result<(), WireError> {
        self.send(DataKind::BINARY_OBJECT, &Payload::object(value)?, FrameHeader::new())
            .await
    }

    /// Send a file from disk; images go as `Image`, anything else as `File`.
    pub async fn send_file(&self, path: impl AsRef<Path>) -> Result<(), WireError> {
        let path = path.as_ref();
        let payload = Payload::from_path(path).await?;
        let header = match &payload {
            Payload::File(FilePayload { name, .. }) => FrameHeader::new().with(NAME_KEY, name.clone()),
            _ => match path.file_name() {
                Some(name) => FrameHeader::new().with(NAME_KEY, name.to_string_lossy()),
                None => FrameHeader::new(),
            },
        };
        self.send(payload.default_kind(), &payload, header).await
    }

    /// Next received frame, in arrival order. `None` once the connection has
    /// ended and every buffered frame has been taken.
    pub async fn recv(&self) -> Option<Inbound> {
        self.inner.inbox.lock().await.recv().await
    }

    /// Tell the peer we are leaving, then close.
    pub async fn disconnect(&self) {
        if self.state() == ConnectionState::Connected {
            let frame = DataFrame::new(DataKind::TERMINATION, FrameHeader::new(), Vec::new());
            if let Err(e) = self.enqueue(frame).await {
                debug!(connection = %self, error = %e, "Could not send termination");
            }
        }
        self.close();
    }

    /// Close immediately. Idempotent; a frame already being written is
    /// finished, queued frames fail with `ConnectionClosed`.
    pub fn close(&self) {
        if self.transition(ConnectionState::Closed, None) {
            info!(connection = %self, "Connection closed");
        }
        self.teardown();
    }

    fn teardown(&self) {
        lock(&self.inner.outbox).take();
        lock(&self.inner.inbox_tx).take();
        if let Some(reader) = lock(&self.inner.reader).take() {
            reader.abort();
        }
        self.inner.stop_monitor();
    }
}

async fn write_loop(
    weak: Weak<Inner>,
    events: broadcast::Sender<ConnectionEvent>,
    percentage: u8,
    mut writer: OwnedWriteHalf,
    mut jobs: mpsc::Receiver<SendJob>,
) {
    while let Some(job) = jobs.recv().await {
        let Some(connection) = Connection::upgrade(&weak) else {
            let _ = job.done.send(Err(WireError::ConnectionClosed));
            break;
        };
        if connection.state().is_terminal() {
            let _ = job.done.send(Err(WireError::ConnectionClosed));
            continue;
        }

        let name = job.frame.name().to_string();
        let report = |state| {
            let _ = events.send(ConnectionEvent::Sending(TransferProgress::new(
                &name,
                DataComponent::All,
                state,
            )));
        };
        report(ActionState::Started);
        let result = frame::write_frame(&mut writer, &job.frame, percentage, |p| {
            let _ = events.send(ConnectionEvent::Sending(p));
        })
        .await;

        match result {
            Ok(()) => {
                report(ActionState::Completed);
                debug!(
                    connection = %connection,
                    name = %name,
                    kind = %job.frame.kind,
                    bytes = job.frame.payload.len(),
                    "Frame sent"
                );
                let _ = job.done.send(Ok(()));
            }
            Err(e) => {
                report(ActionState::Failed);
                let code = e.error_code();
                let reason = e.to_string();
                let _ = job.done.send(Err(e));
                connection.fail(code, &reason);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    weak: Weak<Inner>,
    events: broadcast::Sender<ConnectionEvent>,
    limits: FrameLimits,
    codecs: Arc<CodecRegistry>,
    mut reader: OwnedReadHalf,
    inbox: mpsc::Sender<Inbound>,
) {
    loop {
        let result = frame::read_frame(&mut reader, &limits, |p| {
            let _ = events.send(ConnectionEvent::Receiving(p));
        })
        .await;
        let Some(connection) = Connection::upgrade(&weak) else {
            break;
        };

        let frame = match result {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                connection.fail(ErrorCode::ConnectionClosed, &"peer closed the stream");
                break;
            }
            Err(e) => {
                let _ = events.send(ConnectionEvent::Receiving(TransferProgress::new(
                    "",
                    DataComponent::All,
                    ActionState::Failed,
                )));
                connection.fail(e.error_code(), &e);
                break;
            }
        };

        if frame.kind.is_control() {
            if frame.kind == DataKind::TERMINATION {
                info!(connection = %connection, "Peer disconnected");
                connection.close();
                break;
            }
            connection.receive_information(&frame);
            continue;
        }

        let name = frame.name().to_string();
        let item = match codecs.decode(&frame.kind, &frame.payload, &frame.header) {
            Ok(payload) => {
                debug!(
                    connection = %connection,
                    name = %name,
                    kind = %frame.kind,
                    bytes = frame.payload.len(),
                    "Frame received"
                );
                Ok(ReceivedData {
                    header: frame.header,
                    kind: frame.kind,
                    payload,
                    footer: frame.footer,
                })
            }
            Err(source) => {
                warn!(connection = %connection, name = %name, error = %source, "Could not decode frame");
                Err(DecodeFailure {
                    name: name.clone(),
                    kind: frame.kind,
                    source,
                })
            }
        };
        let state = if item.is_ok() {
            ActionState::Completed
        } else {
            ActionState::Failed
        };
        let _ = events.send(ConnectionEvent::Receiving(TransferProgress::new(
            name,
            DataComponent::All,
            state,
        )));
        drop(connection);
        if inbox.send(item).await.is_err() {
            break;
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => self.id() == other.id(),
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.identity() {
            Some(identity) => write!(f, "{identity}"),
            None => match self.remote_addr() {
                Some(addr) => write!(f, "{addr}"),
                None => write!(f, "{}", self.id()),
            },
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("identity", &self.identity())
            .field("state", &self.state())
            .field("last_error", &self.last_error())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::LoopbackDiscovery;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn context(name: &str, port: u16) -> ConnectionContext {
        context_with_progress(name, port, CommunicatorConfig::default().progress_percentage)
    }

    fn context_with_progress(name: &str, port: u16, progress_percentage: u8) -> ConnectionContext {
        let config = CommunicatorConfig {
            name: name.into(),
            progress_percentage,
            ..Default::default()
        };
        ConnectionContext::from_config(&config, port)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    /// A resolved client connection and the server side that accepted it.
    async fn pair() -> (Connection, Connection, LoopbackDiscovery, ServiceDescriptor) {
        pair_with_progress(CommunicatorConfig::default().progress_percentage).await
    }

    async fn pair_with_progress(
        progress_percentage: u8,
    ) -> (Connection, Connection, LoopbackDiscovery, ServiceDescriptor) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let discovery = LoopbackDiscovery::new();
        let descriptor = ServiceDescriptor::new("Test", "communicate", "local", port);
        discovery.publish(&descriptor, b"\x03v=1").await.unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = Connection::outbound(
            descriptor.clone(),
            context_with_progress("Client", 40000, progress_percentage)
                .with_transport(Arc::new(discovery.clone())),
        );
        client.resolve(Duration::from_secs(2)).await.unwrap();
        let server = Connection::inbound(
            accept.await.unwrap(),
            context_with_progress("Test", port, progress_percentage),
        );
        (client, server, discovery, descriptor)
    }

    #[tokio::test]
    async fn test_send_and_receive_text() {
        let (client, server, _discovery, _) = pair().await;
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(server.state(), ConnectionState::Connected);

        client.send_text("Hello Test").await.unwrap();
        let received = server.recv().await.unwrap().unwrap();
        assert_eq!(received.kind, DataKind::TEXT);
        assert_eq!(received.payload.as_text(), Some("Hello Test"));
        assert_eq!(received.length(), 10);

        // Both sides learn who the other is.
        eventually(|| server.remote_information().is_some()).await;
        assert_eq!(server.identity(), Some(PeerIdentity::new("Client", 40000)));
        eventually(|| client.remote_information().is_some()).await;
        assert_eq!(client.remote_information().unwrap().name, "Test");
    }

    #[tokio::test]
    async fn test_caller_header_reaches_peer() {
        let (client, server, _discovery, _) = pair().await;
        let mut header = FrameHeader::new().with("room", "kitchen");
        header.set_int("seq", 7);
        header.set_float("gain", 0.1);
        header.set_bool("urgent", true);
        client
            .send(DataKind::TEXT, &Payload::text("ping"), header)
            .await
            .unwrap();

        let received = server.recv().await.unwrap().unwrap();
        assert_eq!(received.header.get("room"), Some("kitchen"));
        assert_eq!(received.header.get_int("seq").unwrap(), 7);
        assert_eq!(received.header.get_float("gain").unwrap(), 0.1);
        assert!(received.header.get_bool("urgent").unwrap());
        assert_eq!(received.length(), 4);
    }

    #[tokio::test]
    async fn test_control_kinds_are_reserved() {
        let (client, server, _discovery, _) = pair().await;
        let termination = DataFrame::new(DataKind::TERMINATION, FrameHeader::new(), Vec::new());
        let err = client.send_frame(termination).await.unwrap_err();
        assert!(matches!(err, WireError::ReservedKind(kind) if kind == DataKind::TERMINATION));

        let info = DataFrame::new(DataKind::CONNECTION_INFORMATION, FrameHeader::new(), b"{}".to_vec());
        assert!(matches!(
            client.send_frame(info).await,
            Err(WireError::ReservedKind(_))
        ));

        // The connection is untouched.
        assert_eq!(client.state(), ConnectionState::Connected);
        client.send_text("still here").await.unwrap();
        let received = server.recv().await.unwrap().unwrap();
        assert_eq!(received.payload.as_text(), Some("still here"));
    }

    #[tokio::test]
    async fn test_close_during_send_never_delivers_partial_frame() {
        const SIZE: usize = 8 * 1024 * 1024;
        let (client, server, _discovery, _) = pair_with_progress(1).await;
        // Nothing unread on the client side, so closing ends the stream cleanly.
        eventually(|| client.remote_information().is_some()).await;
        let mut sending = client.subscribe();

        let sender = {
            let client = client.clone();
            tokio::spawn(async move {
                let header = FrameHeader::new().with(NAME_KEY, "big");
                client
                    .send(DataKind::BYTES, &Payload::Bytes(vec![7u8; SIZE]), header)
                    .await
            })
        };
        loop {
            match sending.recv().await {
                Ok(ConnectionEvent::Sending(p))
                    if p.name == "big"
                        && p.component == DataComponent::Body
                        && matches!(p.state, ActionState::Updating(_)) =>
                {
                    break
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
        client.close();
        let result = sender.await.unwrap();
        assert!(matches!(result, Ok(()) | Err(WireError::ConnectionClosed)));

        let mut delivered = Vec::new();
        while let Some(item) = server.recv().await {
            delivered.push(item);
        }
        assert!(delivered.len() <= 1);
        for item in &delivered {
            let data = item.as_ref().unwrap();
            assert_eq!(data.payload.as_bytes().map(<[u8]>::len), Some(SIZE));
            assert_eq!(data.length(), SIZE as u64);
        }
        let end = tokio::time::timeout(Duration::from_secs(5), server.wait_for(|s| s.is_terminal()))
            .await
            .unwrap();
        assert!(end.is_terminal());
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (client, server, _discovery, _) = pair().await;
        for i in 0..20 {
            client.send_text(format!("message {i}")).await.unwrap();
        }
        for i in 0..20 {
            let received = server.recv().await.unwrap().unwrap();
            assert_eq!(received.payload.as_text(), Some(format!("message {i}").as_str()));
        }
    }

    #[tokio::test]
    async fn test_progress_events() {
        let (client, server, _discovery, _) = pair().await;
        let mut sending = client.subscribe();
        let mut receiving = server.subscribe();

        let header = FrameHeader::new().with(NAME_KEY, "blob");
        client
            .send(DataKind::BYTES, &Payload::Bytes(vec![1u8; 4000]), header)
            .await
            .unwrap();
        server.recv().await.unwrap().unwrap();

        let mut saw_updating = false;
        loop {
            if let ConnectionEvent::Sending(p) = sending.recv().await.unwrap() {
                if p.name != "blob" {
                    continue;
                }
                saw_updating |= matches!(p.state, ActionState::Updating(_));
                if p.is_finished() {
                    break;
                }
            }
        }
        assert!(saw_updating);

        loop {
            if let ConnectionEvent::Receiving(p) = receiving.recv().await.unwrap() {
                if p.name == "blob" && p.is_finished() {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_resolve_timeout_fails() {
        let discovery = LoopbackDiscovery::new();
        let descriptor = ServiceDescriptor::new("Nobody", "communicate", "local", 1);
        let connection = Connection::outbound(
            descriptor,
            context("Client", 0).with_transport(Arc::new(discovery)),
        );
        let err = connection
            .resolve(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ResolvingTimedOut));
        assert_eq!(connection.state(), ConnectionState::Failed);
        assert_eq!(connection.last_error(), Some(ErrorCode::ResolvingTimedOut));

        // Terminal states absorb further attempts.
        assert!(connection.connect().await.is_err());
        assert_eq!(connection.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let discovery = LoopbackDiscovery::new();
        let descriptor = ServiceDescriptor::new("Gone", "communicate", "local", port);
        discovery.publish(&descriptor, &[0]).await.unwrap();
        let connection = Connection::outbound(
            descriptor,
            context("Client", 0).with_transport(Arc::new(discovery)),
        );
        let err = connection.resolve(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ConnectionRejected));
        assert_eq!(connection.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_send_requires_connected() {
        let connection = Connection::outbound(
            ServiceDescriptor::new("Test", "communicate", "local", 1),
            context("Client", 0),
        );
        let err = connection.send_text("early").await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ConnectionClosed);

        let err = connection.connect().await.unwrap_err();
        assert!(matches!(err, CommunicateError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, server, _discovery, _) = pair().await;
        let mut events = client.subscribe();
        client.close();
        client.close();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.last_error(), None);

        let mut closed_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ConnectionEvent::StateChanged { state: ConnectionState::Closed, .. }) {
                closed_events += 1;
            }
        }
        assert_eq!(closed_events, 1);

        let err = client.send_text("late").await.unwrap_err();
        assert!(matches!(err, WireError::ConnectionClosed));

        // The peer sees the stream end.
        server.wait_for(|s| s.is_terminal()).await;
        assert_eq!(server.state(), ConnectionState::Closed);
        assert_eq!(server.last_error(), Some(ErrorCode::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_graceful_disconnect() {
        let (client, server, _discovery, _) = pair().await;
        eventually(|| client.remote_information().is_some()).await;
        client.send_text("bye").await.unwrap();
        client.disconnect().await;

        let received = server.recv().await.unwrap().unwrap();
        assert_eq!(received.payload.as_text(), Some("bye"));
        assert!(server.recv().await.is_none());
        assert_eq!(server.state(), ConnectionState::Closed);
        assert_eq!(server.last_error(), None);
    }

    async fn raw_pair() -> (TcpStream, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let raw = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        (raw, Connection::inbound(stream, context("Test", addr.port())))
    }

    #[tokio::test]
    async fn test_malformed_header_fails_connection() {
        let (mut raw, server) = raw_pair().await;
        let garbage = b"{{{{ not json";
        raw.write_all(&(garbage.len() as u32).to_be_bytes()).await.unwrap();
        raw.write_all(garbage).await.unwrap();

        server.wait_for(|s| s.is_terminal()).await;
        assert_eq!(server.state(), ConnectionState::Failed);
        assert_eq!(server.last_error(), Some(ErrorCode::ConnectionUnknownError));
    }

    #[tokio::test]
    async fn test_truncated_frame_closes_connection() {
        let (mut raw, server) = raw_pair().await;
        let bytes = DataFrame::new(DataKind::TEXT, FrameHeader::new(), b"Hello Test".to_vec())
            .encode()
            .unwrap();
        raw.write_all(&bytes[..bytes.len() - 3]).await.unwrap();
        raw.shutdown().await.unwrap();

        server.wait_for(|s| s.is_terminal()).await;
        assert_eq!(server.state(), ConnectionState::Closed);
        assert_eq!(server.last_error(), Some(ErrorCode::ConnectionClosed));
        assert!(server.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_delivered_as_failure() {
        let (mut raw, server) = raw_pair().await;
        let bad = DataFrame::new(DataKind::TEXT, FrameHeader::new(), vec![0xff, 0xfe]);
        let good = DataFrame::new(DataKind::TEXT, FrameHeader::new(), b"ok".to_vec());
        raw.write_all(&bad.encode().unwrap()).await.unwrap();
        raw.write_all(&good.encode().unwrap()).await.unwrap();

        let failure = server.recv().await.unwrap().unwrap_err();
        assert_eq!(failure.kind, DataKind::TEXT);
        assert!(matches!(failure.source, CodecError::Malformed { .. }));
        let next = server.recv().await.unwrap().unwrap();
        assert_eq!(next.payload.as_text(), Some("ok"));
        assert_eq!(server.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_footer_reaches_peer() {
        let (client, server, _discovery, _) = pair().await;
        let frame = DataFrame::new(DataKind::TEXT, FrameHeader::new(), b"body".to_vec())
            .with_footer(FrameHeader::new().with("checksum", "1234"));
        client.send_frame(frame).await.unwrap();

        let received = server.recv().await.unwrap().unwrap();
        assert_eq!(received.footer.get("checksum"), Some("1234"));
    }

    #[tokio::test]
    async fn test_txt_records_follow_publication() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let discovery = LoopbackDiscovery::new();
        let descriptor = ServiceDescriptor::new("Test", "communicate", "local", port);
        let handle = discovery.publish(&descriptor, b"\x03v=1").await.unwrap();

        let _accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client = Connection::outbound(
            descriptor,
            context("Client", 0).with_transport(Arc::new(discovery.clone())),
        );
        client.resolve(Duration::from_secs(2)).await.unwrap();
        eventually(|| client.txt_records().get("v") == Some("1")).await;

        discovery.update_metadata(handle, b"\x03v=2").await.unwrap();
        eventually(|| client.txt_records().get("v") == Some("2")).await;
    }

    #[test]
    fn test_equality_by_identity() {
        let a = Connection::outbound(
            ServiceDescriptor::new("Test", "communicate", "local", 12345),
            context("Client", 0),
        );
        let b = Connection::outbound(
            ServiceDescriptor::new("Test", "communicate", "local", 12345),
            context("Client", 0),
        );
        let c = Connection::outbound(
            ServiceDescriptor::new("Test", "communicate", "local", 12346),
            context("Client", 0),
        );
        assert_eq!(a, b);
        assert_ne!(a.id(), b.id());
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "Test:12345");
    }
}
