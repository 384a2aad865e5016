//! Connection information exchanged right after a connection opens.

use crate::descriptor::PeerIdentity;
use crate::registered::{Platform, Version};
use serde::{Deserialize, Serialize};

/// What a peer tells the other side about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInformation {
    /// Advertised service name of the sender.
    pub name: String,
    /// Port the sender advertises and listens on.
    pub port: u16,
    /// Protocol version of the sender.
    pub version: Version,
    /// Platform of the sender.
    pub platform: Platform,
}

impl ConnectionInformation {
    /// Information describing the running process.
    pub fn local(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            version: Version::CURRENT,
            platform: Platform::current(),
        }
    }

    /// The identity the sender advertises under.
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::new(self.name.clone(), self.port)
    }

    /// Whether both sides speak the same protocol version.
    pub fn is_compatible(&self) -> bool {
        self.version == Version::CURRENT
    }
}
