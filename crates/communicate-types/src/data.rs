//! Payload kinds and transfer progress.

use crate::registered::{ObjectKind, ObjectRegistry, RegisteredObject};
use serde::{Deserialize, Serialize};

/// Value-set marker for payload kinds.
pub enum DataKindTag {}

impl ObjectKind for DataKindTag {
    const KIND: &'static str = "DataKind";

    fn registry() -> &'static ObjectRegistry<Self> {
        static REGISTRY: ObjectRegistry<DataKindTag> = ObjectRegistry::new();
        &REGISTRY
    }
}

/// Tag carried in every frame header that selects the payload codec.
///
/// Applications may register additional kinds; identifiers below 1000 are
/// reserved for built-ins.
pub type DataKind = RegisteredObject<DataKindTag>;

impl RegisteredObject<DataKindTag> {
    /// Graceful close request. Never delivered to the application.
    pub const TERMINATION: DataKind = DataKind::define(0, "Termination");
    /// UTF-8 text.
    pub const TEXT: DataKind = DataKind::define(1, "Text");
    /// Encoded image bytes with a MIME type.
    pub const IMAGE: DataKind = DataKind::define(2, "Image");
    /// A file's contents with its name.
    pub const FILE: DataKind = DataKind::define(3, "File");
    /// Peer name, port, version and platform. Never delivered to the application.
    pub const CONNECTION_INFORMATION: DataKind = DataKind::define(4, "Connection Information");
    /// Structured object encoded as JSON.
    pub const JSON_OBJECT: DataKind = DataKind::define(21, "Json Object");
    /// Structured object encoded as MessagePack.
    pub const BINARY_OBJECT: DataKind = DataKind::define(51, "Binary Object");
    /// Opaque bytes.
    pub const BYTES: DataKind = DataKind::define(99, "Bytes");

    /// Every built-in kind.
    pub const BUILTIN: [DataKind; 8] = [
        Self::TERMINATION,
        Self::TEXT,
        Self::IMAGE,
        Self::FILE,
        Self::CONNECTION_INFORMATION,
        Self::JSON_OBJECT,
        Self::BINARY_OBJECT,
        Self::BYTES,
    ];

    /// Kinds consumed by the connection itself rather than the application.
    pub fn is_control(&self) -> bool {
        self.is_one_of(&[Self::TERMINATION, Self::CONNECTION_INFORMATION])
    }

    /// Kinds whose payload decodes to a structured object.
    pub fn is_object(&self) -> bool {
        self.is_one_of(&[Self::JSON_OBJECT, Self::BINARY_OBJECT])
    }
}

/// Part of a frame a progress report refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataComponent {
    Header,
    Body,
    Footer,
    /// The frame as a whole.
    All,
}

/// Phase of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ActionState {
    Started,
    /// Part of the component has moved; the value is the completed fraction.
    Updating(f32),
    Completed,
    Failed,
}

/// One progress report emitted while sending or receiving a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// Content name of the frame (`Name` header).
    pub name: String,
    /// Which part of the frame.
    pub component: DataComponent,
    /// Transfer phase.
    pub state: ActionState,
}

impl TransferProgress {
    /// Build a progress report.
    pub fn new(name: impl Into<String>, component: DataComponent, state: ActionState) -> Self {
        Self {
            name: name.into(),
            component,
            state,
        }
    }

    /// Completed fraction in `[0, 1]`.
    pub fn fraction(&self) -> f32 {
        match self.state {
            ActionState::Started | ActionState::Failed => 0.0,
            ActionState::Updating(f) => f.clamp(0.0, 1.0),
            ActionState::Completed => 1.0,
        }
    }

    /// True for the final report of a successful transfer.
    pub fn is_finished(&self) -> bool {
        self.component == DataComponent::All && self.state == ActionState::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_kinds() {
        assert!(DataKind::TERMINATION.is_control());
        assert!(DataKind::CONNECTION_INFORMATION.is_control());
        assert!(!DataKind::TEXT.is_control());
        assert!(DataKind::BINARY_OBJECT.is_object());
    }

    #[test]
    fn test_progress_fraction() {
        let p = TransferProgress::new("a", DataComponent::Body, ActionState::Updating(0.25));
        assert_eq!(p.fraction(), 0.25);
        assert!(!p.is_finished());
        let done = TransferProgress::new("a", DataComponent::All, ActionState::Completed);
        assert_eq!(done.fraction(), 1.0);
        assert!(done.is_finished());
    }
}
