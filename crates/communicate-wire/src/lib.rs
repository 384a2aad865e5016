//! Communicate wire layer: discovery, connections and data framing.
//!
//! Nodes on a LAN advertise themselves through a DNS-SD style discovery
//! transport, find each other by searching, and exchange length-prefixed
//! frames over TCP.
//!
//! ## Architecture
//!
//! - **Communicator**: one node's publish, search, listen and connect surface
//! - **Connection**: per-peer state machine with ordered send and receive
//! - **DataFrame**: header, body and footer framing with progress reporting
//! - **CodecRegistry**: maps data kinds to payload codecs
//! - **DiscoveryTransport**: trait over the discovery stack, with an
//!   in-process loopback implementation

pub mod codec;
pub mod communicator;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod frame;
pub mod registry;

pub use codec::{Codec, CodecError, CodecRegistry, FilePayload, ImagePayload, Payload};
pub use communicator::{
    Communicator, CommunicatorBuilder, CommunicatorEvent, ConnectionFilter, ConnectionRequest,
};
pub use config::{default_config_path, load_config};
pub use connection::{
    Connection, ConnectionContext, ConnectionEvent, DecodeFailure, Inbound, ReceivedData,
    StreamConnector, TcpConnector,
};
pub use discovery::{
    DiscoveryError, DiscoveryEvent, DiscoveryHandle, DiscoveryTransport, LoopbackDiscovery,
    MetadataMonitor, Search,
};
pub use frame::{DataFrame, FrameHeader, FrameLimits, WireError};
pub use registry::{ConnectionRegistry, DiscoveredPeer, PeerRegistry};
