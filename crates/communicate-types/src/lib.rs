//! Core types for the Communicate LAN peer-to-peer toolkit.
//!
//! This crate defines the value types shared by the communicator, the
//! connection state machine and the wire framing: service descriptors, TXT
//! records, registered identifier sets, connection states, transfer progress,
//! the error taxonomy and configuration. It performs no I/O.

pub mod config;
pub mod data;
pub mod descriptor;
pub mod error;
pub mod information;
pub mod registered;
pub mod state;
pub mod txt;

pub use config::CommunicatorConfig;
pub use data::{ActionState, DataComponent, DataKind, TransferProgress};
pub use descriptor::{PeerIdentity, ServiceDescriptor, TransportProtocol};
pub use error::{CommunicateError, CommunicateResult, ErrorCode, ErrorPhase};
pub use information::ConnectionInformation;
pub use registered::{ObjectKind, ObjectRegistry, Platform, RegisteredObject, Version};
pub use state::{ActivityState, ConnectionState};
pub use txt::{DnsTxtCodec, TxtRecordCodec, TxtRecordError, TxtRecordSet};
