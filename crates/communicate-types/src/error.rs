//! Error taxonomy shared by every Communicate component.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle phase an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorPhase {
    Listening,
    Publishing,
    Searching,
    Resolving,
    Connection,
}

/// Closed set of named failures an application can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    ListeningSocketCouldNotOpen,
    ListeningSocketClosed,
    ListeningUnknownError,

    PublishingNotSupported,
    PublishingTimedOut,
    PublishingAlreadyRegistered,
    PublishingNamingCollision,
    PublishingFirewallBlocked,
    PublishingUnknownError,

    SearchingNotSupported,
    SearchingTimedOut,
    SearchingFirewallBlocked,
    SearchingUnknownError,

    ResolvingTimedOut,
    ResolvingUnknownError,

    ConnectionRejected,
    ConnectionClosed,
    ConnectionSocketCreationError,
    ConnectionUnknownError,
}

impl ErrorCode {
    /// The phase this code is reported from.
    pub fn phase(&self) -> ErrorPhase {
        use ErrorCode::*;
        match self {
            ListeningSocketCouldNotOpen | ListeningSocketClosed | ListeningUnknownError => {
                ErrorPhase::Listening
            }
            PublishingNotSupported
            | PublishingTimedOut
            | PublishingAlreadyRegistered
            | PublishingNamingCollision
            | PublishingFirewallBlocked
            | PublishingUnknownError => ErrorPhase::Publishing,
            SearchingNotSupported
            | SearchingTimedOut
            | SearchingFirewallBlocked
            | SearchingUnknownError => ErrorPhase::Searching,
            ResolvingTimedOut | ResolvingUnknownError => ErrorPhase::Resolving,
            ConnectionRejected
            | ConnectionClosed
            | ConnectionSocketCreationError
            | ConnectionUnknownError => ErrorPhase::Connection,
        }
    }

    /// Stable name, identical to the variant name.
    pub fn as_str(&self) -> &'static str {
        use ErrorCode::*;
        match self {
            ListeningSocketCouldNotOpen => "ListeningSocketCouldNotOpen",
            ListeningSocketClosed => "ListeningSocketClosed",
            ListeningUnknownError => "ListeningUnknownError",
            PublishingNotSupported => "PublishingNotSupported",
            PublishingTimedOut => "PublishingTimedOut",
            PublishingAlreadyRegistered => "PublishingAlreadyRegistered",
            PublishingNamingCollision => "PublishingNamingCollision",
            PublishingFirewallBlocked => "PublishingFirewallBlocked",
            PublishingUnknownError => "PublishingUnknownError",
            SearchingNotSupported => "SearchingNotSupported",
            SearchingTimedOut => "SearchingTimedOut",
            SearchingFirewallBlocked => "SearchingFirewallBlocked",
            SearchingUnknownError => "SearchingUnknownError",
            ResolvingTimedOut => "ResolvingTimedOut",
            ResolvingUnknownError => "ResolvingUnknownError",
            ConnectionRejected => "ConnectionRejected",
            ConnectionClosed => "ConnectionClosed",
            ConnectionSocketCreationError => "ConnectionSocketCreationError",
            ConnectionUnknownError => "ConnectionUnknownError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for Communicate operations.
#[derive(Error, Debug)]
pub enum CommunicateError {
    /// An environment failure with a named code.
    #[error("{code}: {reason}")]
    Operation {
        /// The failure code.
        code: ErrorCode,
        /// Detail from the underlying transport or socket.
        reason: String,
    },

    /// The object is in the wrong state for the requested operation.
    #[error("Invalid state '{current}' for operation '{operation}'")]
    InvalidState {
        /// The state at the time of the call.
        current: String,
        /// The operation that was attempted.
        operation: String,
    },

    /// The caller passed an argument that can never succeed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A configuration value is out of range or unreadable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error with no more specific code.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommunicateError {
    /// Build an [`CommunicateError::Operation`].
    pub fn operation(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::Operation {
            code,
            reason: reason.into(),
        }
    }

    /// The named code, when this error carries one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Operation { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<ErrorCode> for CommunicateError {
    fn from(code: ErrorCode) -> Self {
        Self::operation(code, code.as_str())
    }
}

/// Alias for Result with CommunicateError.
pub type CommunicateResult<T> = Result<T, CommunicateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases() {
        assert_eq!(ErrorCode::PublishingNamingCollision.phase(), ErrorPhase::Publishing);
        assert_eq!(ErrorCode::SearchingTimedOut.phase(), ErrorPhase::Searching);
        assert_eq!(ErrorCode::ResolvingTimedOut.phase(), ErrorPhase::Resolving);
        assert_eq!(ErrorCode::ConnectionClosed.phase(), ErrorPhase::Connection);
        assert_eq!(ErrorCode::ListeningSocketClosed.phase(), ErrorPhase::Listening);
    }

    #[test]
    fn test_display_matches_serde_name() {
        let code = ErrorCode::ConnectionSocketCreationError;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, format!("\"{code}\""));
    }

    #[test]
    fn test_error_code_accessor() {
        let err = CommunicateError::operation(ErrorCode::ConnectionRejected, "refused");
        assert_eq!(err.code(), Some(ErrorCode::ConnectionRejected));
        assert_eq!(err.to_string(), "ConnectionRejected: refused");

        let err: CommunicateError = ErrorCode::ConnectionClosed.into();
        assert_eq!(err.code(), Some(ErrorCode::ConnectionClosed));

        let err = CommunicateError::InvalidInput("empty name".into());
        assert_eq!(err.code(), None);
    }
}
