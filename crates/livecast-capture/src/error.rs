//! Error types for the capture module.

use thiserror::Error;

/// Errors that can occur during capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Camera or microphone access was refused.
    #[error("Permission denied for capture")]
    PermissionDenied,

    /// Capture device not found.
    #[error("Capture device not found: {0}")]
    DeviceNotFound(String),

    /// No container/codec the source can produce.
    #[error("No supported recording format: {0}")]
    Unsupported(String),

    /// The recorder already stopped or failed; create a new one.
    #[error("Recorder already finished")]
    AlreadyFinished,

    /// Unrecoverable error reported by the source.
    #[error("Capture failed: {0}")]
    Failed(String),

    /// Channel send error.
    #[error("Failed to send segment: channel disconnected")]
    ChannelDisconnected,
}
