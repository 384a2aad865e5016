//! Lifecycle states for connections and communicator activities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a single peer connection.
///
/// ```text
/// Unresolved -> Resolving -> Resolved -> Connecting -> Connected -> Closed
///      \____________\____________\____________\____________\-----> Failed
/// ```
///
/// Any non-terminal state may also move straight to `Closed` when the
/// application closes the connection. `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Unresolved,
    Resolving,
    Resolved,
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl ConnectionState {
    /// `Closed` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (*self, next),
            (Unresolved, Resolving)
                | (Resolving, Resolved)
                | (Resolved, Connecting)
                | (Connecting, Connected)
                | (_, Closed)
                | (_, Failed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Unresolved => "unresolved",
            ConnectionState::Resolving => "resolving",
            ConnectionState::Resolved => "resolved",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// State of a communicator activity: publishing, searching or listening.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityState {
    /// Never started.
    #[default]
    Ready,
    Starting,
    Started,
    Stopped,
    /// The last attempt failed; see the accompanying error code.
    Error,
}

impl ActivityState {
    /// `Starting` or `Started`.
    pub fn is_active(&self) -> bool {
        matches!(self, ActivityState::Starting | ActivityState::Started)
    }
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActivityState::Ready => "ready",
            ActivityState::Starting => "starting",
            ActivityState::Started => "started",
            ActivityState::Stopped => "stopped",
            ActivityState::Error => "error",
        };
        f.write_str(s)
    }
}
