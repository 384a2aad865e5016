//! Service descriptors: the advertised identity of a discoverable service.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport a service is reachable over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Tcp,
}

impl TransportProtocol {
    /// Lowercase protocol label used in DNS-SD type strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value identity of a peer: advertised name plus port.
///
/// Known before resolution, so two handles for the same advertised service
/// can be matched without touching the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub name: String,
    pub port: u16,
}

impl PeerIdentity {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

/// An advertised service. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    name: String,
    type_tag: String,
    transport: TransportProtocol,
    domain: String,
    port: u16,
}

impl ServiceDescriptor {
    /// Describe a TCP service.
    ///
    /// `type_tag` is the bare application tag (`"communicate"`), without the
    /// leading underscore or transport suffix.
    pub fn new(
        name: impl Into<String>,
        type_tag: impl Into<String>,
        domain: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
            transport: TransportProtocol::Tcp,
            domain: domain.into(),
            port,
        }
    }

    /// Replace the transport protocol.
    pub fn with_transport(mut self, transport: TransportProtocol) -> Self {
        self.transport = transport;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn transport(&self) -> TransportProtocol {
        self.transport
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// DNS-SD service type, e.g. `_communicate._tcp`.
    pub fn service_type(&self) -> String {
        format!("_{}._{}", self.type_tag, self.transport)
    }

    /// Fully qualified instance name, e.g. `Test._communicate._tcp.local.`.
    pub fn full_name(&self) -> String {
        format!("{}.{}.{}.", self.name, self.service_type(), self.domain)
    }

    /// The `(name, port)` identity used to deduplicate peers.
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::new(self.name.clone(), self.port)
    }

    /// Whether this descriptor belongs to the given search scope.
    pub fn matches(&self, type_tag: &str, domain: &str) -> bool {
        self.type_tag == type_tag && self.domain == domain
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (port {})", self.full_name(), self.port)
    }
}
