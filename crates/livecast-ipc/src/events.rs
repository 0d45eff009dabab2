//! Events sent from the broadcast core to the UI.

use serde::{Deserialize, Serialize};

use crate::state::{AudienceStatus, ErrorKind, HostStatus};
use crate::types::SessionId;

/// Stages of the end-of-broadcast recording pipeline, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    /// Stopping local capture.
    StopCapture,

    /// Compressing the raw capture.
    Compress,

    /// Extracting a thumbnail frame.
    Thumbnail,

    /// Uploading to object storage.
    Upload,

    /// Writing the final session and post records.
    Finalize,
}

impl PipelineStage {
    /// Returns the next stage, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::StopCapture => Some(Self::Compress),
            Self::Compress => Some(Self::Thumbnail),
            Self::Thumbnail => Some(Self::Upload),
            Self::Upload => Some(Self::Finalize),
            Self::Finalize => None,
        }
    }

    /// Returns the display name for this stage.
    pub fn name(self) -> &'static str {
        match self {
            Self::StopCapture => "Stopping recording",
            Self::Compress => "Compressing",
            Self::Thumbnail => "Generating thumbnail",
            Self::Upload => "Uploading",
            Self::Finalize => "Saving",
        }
    }
}

/// Events that the broadcast core can send to the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BroadcastEvent {
    /// Host page status has changed.
    HostStatusChanged {
        previous: Box<HostStatus>,
        current: Box<HostStatus>,
    },

    /// Audience page status has changed.
    AudienceStatusChanged {
        previous: AudienceStatus,
        current: AudienceStatus,
    },

    /// The host's remote video appeared or disappeared.
    RemoteVideo { present: bool },

    /// Viewer count as observed by the transport.
    ViewerCount(u32),

    /// Fractional progress of a pipeline stage (0.0 - 1.0).
    PipelineProgress { stage: PipelineStage, progress: f32 },

    /// A session was created and is now live.
    SessionStarted { session_id: SessionId, channel: String },

    /// A session reached `ended`.
    SessionEnded { session_id: SessionId },

    /// Error occurred.
    Error {
        kind: ErrorKind,

        /// Error message, derived from `kind` where possible.
        message: String,
    },
}
