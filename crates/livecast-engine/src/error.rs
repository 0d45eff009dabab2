//! Error types for the engine module.

use livecast_capture::CaptureError;
use livecast_ipc::{ErrorKind, PostId, RecordingStatus, SessionId};
use livecast_store::StoreError;
use livecast_transport::ConnectionError;
use thiserror::Error;

/// Errors that can occur in the broadcast engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The operation needs a signed-in actor.
    #[error("Not signed in")]
    NotAuthenticated,

    #[error("Live session {0} not found")]
    SessionNotFound(SessionId),

    #[error("Post {0} not found")]
    PostNotFound(PostId),

    /// The session already ended.
    #[error("Live session {0} has ended")]
    SessionEnded(SessionId),

    /// The actor is not the host of the session.
    #[error("Only the host can do this")]
    NotHost,

    /// Recording status would move backwards.
    #[error("Recording status cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        from: RecordingStatus,
        to: RecordingStatus,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Token issuing failed: {0}")]
    Token(String),

    #[error("Compression failed: {0}")]
    Transcode(String),

    #[error("Thumbnail extraction failed: {0}")]
    Thumbnail(String),

    /// The owning page went away.
    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

impl EngineError {
    /// Category used for user-facing messages.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(e) => e.kind(),
            Self::Capture(CaptureError::PermissionDenied) => ErrorKind::PermissionDenied,
            Self::Capture(CaptureError::DeviceNotFound(_)) => ErrorKind::DeviceNotFound,
            Self::Store(StoreError::Unavailable(_)) | Self::Token(_) => ErrorKind::Network,
            Self::Store(StoreError::Upload(_)) => ErrorKind::UploadFailed,
            Self::Transcode(_) => ErrorKind::CompressionFailed,
            _ => ErrorKind::Other,
        }
    }

    /// Message for the user, derived from the category where possible.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Other => self.to_string(),
            kind => kind.user_message().to_string(),
        }
    }

    /// Translate into a transport error for the credential path. Only
    /// transient causes stay retryable.
    pub fn into_connection_error(self) -> ConnectionError {
        match self {
            Self::Connection(e) => e,
            Self::Store(StoreError::Unavailable(reason)) | Self::Token(reason) => {
                ConnectionError::Credential(reason)
            }
            other => ConnectionError::Refused(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn credential_errors_keep_retryability() {
        let transient = EngineError::Store(StoreError::Unavailable("down".into()));
        assert!(transient.into_connection_error().is_retryable());

        let ended = EngineError::SessionEnded(Uuid::new_v4());
        assert!(!ended.into_connection_error().is_retryable());
    }

    #[test]
    fn pipeline_errors_map_to_kinds() {
        assert_eq!(
            EngineError::Transcode("codec".into()).kind(),
            ErrorKind::CompressionFailed
        );
        assert_eq!(
            EngineError::Store(StoreError::Upload("reset".into())).kind(),
            ErrorKind::UploadFailed
        );
        assert_eq!(EngineError::NotHost.user_message(), "Only the host can do this");
    }
}
