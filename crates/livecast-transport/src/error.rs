//! Error types for the transport module.

use livecast_ipc::{ErrorKind, Role};
use thiserror::Error;

/// Errors that can occur during connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Camera or microphone access refused.
    #[error("Permission denied for camera or microphone")]
    PermissionDenied,

    /// No capture device available.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Transient network failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Operation did not finish in time.
    #[error("Timed out")]
    Timeout,

    /// The channel credential expired.
    #[error("Token expired")]
    TokenExpired,

    /// Credential service refused or failed.
    #[error("Credential request failed: {0}")]
    Credential(String),

    /// Credential service refused for good (unknown or ended session,
    /// wrong role).
    #[error("Credential refused: {0}")]
    Refused(String),

    /// Operation not available for this role.
    #[error("Operation requires the {0:?} role")]
    WrongRole(Role),

    /// Operation requires a joined channel.
    #[error("Not joined")]
    NotJoined,

    /// The client already holds a join.
    #[error("Already joined")]
    AlreadyJoined,

    /// The attempt was aborted by `leave()` or page teardown.
    #[error("Cancelled")]
    Cancelled,

    /// Transport reported an error that has no dedicated category.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Category used for user-facing messages.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Self::Network(_) | Self::Credential(_) => ErrorKind::Network,
            Self::Timeout => ErrorKind::Timeout,
            Self::TokenExpired => ErrorKind::TokenExpired,
            _ => ErrorKind::Other,
        }
    }

    /// Whether a rejoin may succeed after this error.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Message for the user. Falls back to the raw error text only when
    /// the error has no category.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Other => self.to_string(),
            kind => kind.user_message().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_drives_retry_and_message() {
        assert!(ConnectionError::Network("reset".into()).is_retryable());
        assert!(ConnectionError::Timeout.is_retryable());
        assert!(!ConnectionError::PermissionDenied.is_retryable());
        assert!(ConnectionError::Credential("503".into()).is_retryable());
        assert!(!ConnectionError::Refused("session ended".into()).is_retryable());
        assert_eq!(
            ConnectionError::DeviceNotFound("camera".into()).user_message(),
            ErrorKind::DeviceNotFound.user_message()
        );
        assert_eq!(
            ConnectionError::Transport("boom".into()).user_message(),
            "Transport error: boom"
        );
    }
}
