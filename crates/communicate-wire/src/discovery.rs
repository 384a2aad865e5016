//! Discovery transport: publish, search, resolve and TXT monitoring.
//!
//! [`DiscoveryTransport`] is the seam to a DNS-SD/mDNS stack. The crate ships
//! [`LoopbackDiscovery`], an in-process registry that behaves like a LAN with
//! every peer on this host. It backs the tests and the demo, and lets a
//! single process run both ends of a connection.

use async_trait::async_trait;
use communicate_types::{ErrorCode, ServiceDescriptor};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// Failures reported by a discovery transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("operation not supported by the discovery transport")]
    NotSupported,
    #[error("discovery operation timed out")]
    TimedOut,
    #[error("service is already registered")]
    AlreadyRegistered,
    #[error("service name collides with an existing registration")]
    NamingCollision,
    #[error("blocked by firewall")]
    FirewallBlocked,
    #[error("discovery error: {0}")]
    Unknown(String),
}

impl DiscoveryError {
    /// Code reported when publishing fails with this error.
    pub fn for_publishing(&self) -> ErrorCode {
        match self {
            DiscoveryError::NotSupported => ErrorCode::PublishingNotSupported,
            DiscoveryError::TimedOut => ErrorCode::PublishingTimedOut,
            DiscoveryError::AlreadyRegistered => ErrorCode::PublishingAlreadyRegistered,
            DiscoveryError::NamingCollision => ErrorCode::PublishingNamingCollision,
            DiscoveryError::FirewallBlocked => ErrorCode::PublishingFirewallBlocked,
            DiscoveryError::Unknown(_) => ErrorCode::PublishingUnknownError,
        }
    }

    /// Code reported when searching fails with this error.
    pub fn for_searching(&self) -> ErrorCode {
        match self {
            DiscoveryError::NotSupported => ErrorCode::SearchingNotSupported,
            DiscoveryError::TimedOut => ErrorCode::SearchingTimedOut,
            DiscoveryError::FirewallBlocked => ErrorCode::SearchingFirewallBlocked,
            _ => ErrorCode::SearchingUnknownError,
        }
    }

    /// Code reported when resolving fails with this error.
    pub fn for_resolving(&self) -> ErrorCode {
        match self {
            DiscoveryError::TimedOut => ErrorCode::ResolvingTimedOut,
            _ => ErrorCode::ResolvingUnknownError,
        }
    }
}

/// Opaque token for an active publication, search or monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiscoveryHandle(pub u64);

/// A change seen by an active search.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Added(ServiceDescriptor),
    Removed(ServiceDescriptor),
    /// The search broke after it started; no further events follow.
    Failed(DiscoveryError),
}

/// A running search and its event stream, in transport order.
#[derive(Debug)]
pub struct Search {
    pub handle: DiscoveryHandle,
    pub events: mpsc::UnboundedReceiver<DiscoveryEvent>,
}

/// A running TXT monitor. Each item is the raw TXT blob.
#[derive(Debug)]
pub struct MetadataMonitor {
    pub handle: DiscoveryHandle,
    pub updates: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// A DNS-SD style discovery stack.
///
/// Stopping is synchronous so that close paths never wait on the network.
#[async_trait]
pub trait DiscoveryTransport: Send + Sync + 'static {
    /// Advertise `descriptor` with the encoded TXT blob.
    async fn publish(
        &self,
        descriptor: &ServiceDescriptor,
        txt: &[u8],
    ) -> Result<DiscoveryHandle, DiscoveryError>;

    /// Replace the TXT blob of an active publication.
    async fn update_metadata(&self, handle: DiscoveryHandle, txt: &[u8]) -> Result<(), DiscoveryError>;

    fn unpublish(&self, handle: DiscoveryHandle);

    /// Browse for services of `type_tag` in `domain`.
    async fn search(&self, type_tag: &str, domain: &str) -> Result<Search, DiscoveryError>;

    fn stop_search(&self, handle: DiscoveryHandle);

    /// Find the socket address of a discovered service.
    async fn resolve(
        &self,
        descriptor: &ServiceDescriptor,
        timeout: Duration,
    ) -> Result<SocketAddr, DiscoveryError>;

    /// Watch a service's TXT records.
    async fn monitor_metadata(&self, descriptor: &ServiceDescriptor) -> Result<MetadataMonitor, DiscoveryError>;

    fn stop_monitor(&self, handle: DiscoveryHandle);
}

struct Registration {
    descriptor: ServiceDescriptor,
    txt: Vec<u8>,
}

struct Browser {
    type_tag: String,
    domain: String,
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
}

struct Monitor {
    full_name: String,
    port: u16,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct LoopbackState {
    services: BTreeMap<u64, Registration>,
    browsers: HashMap<u64, Browser>,
    monitors: HashMap<u64, Monitor>,
    unsupported: bool,
    firewall_blocked: bool,
}

impl LoopbackState {
    fn broadcast(&mut self, descriptor: &ServiceDescriptor, event: impl Fn() -> DiscoveryEvent) {
        self.browsers.retain(|_, b| {
            if !descriptor.matches(&b.type_tag, &b.domain) {
                return !b.tx.is_closed();
            }
            b.tx.send(event()).is_ok()
        });
    }

    fn notify_monitors(&mut self, descriptor: &ServiceDescriptor, txt: &[u8]) {
        let full_name = descriptor.full_name();
        self.monitors.retain(|_, m| {
            if m.full_name != full_name || m.port != descriptor.port() {
                return !m.tx.is_closed();
            }
            m.tx.send(txt.to_vec()).is_ok()
        });
    }

    fn check_available(&self) -> Result<(), DiscoveryError> {
        if self.unsupported {
            return Err(DiscoveryError::NotSupported);
        }
        if self.firewall_blocked {
            return Err(DiscoveryError::FirewallBlocked);
        }
        Ok(())
    }

    fn find(&self, descriptor: &ServiceDescriptor) -> Option<&Registration> {
        let full_name = descriptor.full_name();
        self.services
            .values()
            .find(|r| r.descriptor.full_name() == full_name && r.descriptor.port() == descriptor.port())
    }
}

struct LoopbackInner {
    next_handle: AtomicU64,
    host: IpAddr,
    state: Mutex<LoopbackState>,
    changed: Notify,
}

/// In-process discovery: every clone shares one registry.
///
/// Services resolve to the configured host (127.0.0.1 by default) on their
/// advertised port. Failure switches make the error paths reachable.
#[derive(Clone)]
pub struct LoopbackDiscovery {
    inner: Arc<LoopbackInner>,
}

impl Default for LoopbackDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackDiscovery {
    pub fn new() -> Self {
        Self::with_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// Resolve every service to `host`.
    pub fn with_host(host: IpAddr) -> Self {
        Self {
            inner: Arc::new(LoopbackInner {
                next_handle: AtomicU64::new(1),
                host,
                state: Mutex::new(LoopbackState::default()),
                changed: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopbackState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_handle(&self) -> u64 {
        self.inner.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Make every new publish and search fail with `NotSupported`.
    pub fn set_supported(&self, supported: bool) {
        self.lock().unsupported = !supported;
    }

    /// Make every new publish and search fail with `FirewallBlocked`.
    pub fn set_firewall_blocked(&self, blocked: bool) {
        self.lock().firewall_blocked = blocked;
    }

    /// Break every running search with `error`.
    pub fn fail_searches(&self, error: DiscoveryError) {
        let mut state = self.lock();
        for (_, browser) in state.browsers.drain() {
            let _ = browser.tx.send(DiscoveryEvent::Failed(error.clone()));
        }
    }

    /// Currently published services in publication order.
    pub fn published(&self) -> Vec<ServiceDescriptor> {
        self.lock()
            .services
            .values()
            .map(|r| r.descriptor.clone())
            .collect()
    }
}

#[async_trait]
impl DiscoveryTransport for LoopbackDiscovery {
    async fn publish(
        &self,
        descriptor: &ServiceDescriptor,
        txt: &[u8],
    ) -> Result<DiscoveryHandle, DiscoveryError> {
        let handle = {
            let mut state = self.lock();
            state.check_available()?;
            let full_name = descriptor.full_name();
            if let Some(existing) = state
                .services
                .values()
                .find(|r| r.descriptor.full_name() == full_name)
            {
                return Err(if existing.descriptor.port() == descriptor.port() {
                    DiscoveryError::AlreadyRegistered
                } else {
                    DiscoveryError::NamingCollision
                });
            }

            let id = self.next_handle();
            state.services.insert(
                id,
                Registration {
                    descriptor: descriptor.clone(),
                    txt: txt.to_vec(),
                },
            );
            state.broadcast(descriptor, || DiscoveryEvent::Added(descriptor.clone()));
            DiscoveryHandle(id)
        };
        debug!(service = %descriptor, "Loopback: published");
        self.inner.changed.notify_waiters();
        Ok(handle)
    }

    async fn update_metadata(&self, handle: DiscoveryHandle, txt: &[u8]) -> Result<(), DiscoveryError> {
        let mut state = self.lock();
        let descriptor = match state.services.get_mut(&handle.0) {
            Some(registration) => {
                registration.txt = txt.to_vec();
                registration.descriptor.clone()
            }
            None => return Err(DiscoveryError::Unknown("publication is not active".into())),
        };
        state.notify_monitors(&descriptor, txt);
        Ok(())
    }

    fn unpublish(&self, handle: DiscoveryHandle) {
        let mut state = self.lock();
        if let Some(registration) = state.services.remove(&handle.0) {
            let descriptor = registration.descriptor;
            state.broadcast(&descriptor, || DiscoveryEvent::Removed(descriptor.clone()));
            debug!(service = %descriptor, "Loopback: unpublished");
        }
    }

    async fn search(&self, type_tag: &str, domain: &str) -> Result<Search, DiscoveryError> {
        let mut state = self.lock();
        state.check_available()?;
        let (tx, events) = mpsc::unbounded_channel();
        for registration in state.services.values() {
            if registration.descriptor.matches(type_tag, domain) {
                let _ = tx.send(DiscoveryEvent::Added(registration.descriptor.clone()));
            }
        }
        let id = self.next_handle();
        state.browsers.insert(
            id,
            Browser {
                type_tag: type_tag.to_string(),
                domain: domain.to_string(),
                tx,
            },
        );
        Ok(Search {
            handle: DiscoveryHandle(id),
            events,
        })
    }

    fn stop_search(&self, handle: DiscoveryHandle) {
        self.lock().browsers.remove(&handle.0);
    }

    async fn resolve(
        &self,
        descriptor: &ServiceDescriptor,
        timeout: Duration,
    ) -> Result<SocketAddr, DiscoveryError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let port = self.lock().find(descriptor).map(|r| r.descriptor.port());
            if let Some(port) = port {
                return Ok(SocketAddr::new(self.inner.host, port));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(DiscoveryError::TimedOut);
            }
        }
    }

    async fn monitor_metadata(&self, descriptor: &ServiceDescriptor) -> Result<MetadataMonitor, DiscoveryError> {
        let mut state = self.lock();
        let (tx, updates) = mpsc::unbounded_channel();
        if let Some(registration) = state.find(descriptor) {
            let _ = tx.send(registration.txt.clone());
        }
        let id = self.next_handle();
        state.monitors.insert(
            id,
            Monitor {
                full_name: descriptor.full_name(),
                port: descriptor.port(),
                tx,
            },
        );
        Ok(MetadataMonitor {
            handle: DiscoveryHandle(id),
            updates,
        })
    }

    fn stop_monitor(&self, handle: DiscoveryHandle) {
        self.lock().monitors.remove(&handle.0);
    }
}
