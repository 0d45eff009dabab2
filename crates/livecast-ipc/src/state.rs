//! Session and page state machine types.

use serde::{Deserialize, Serialize};

/// Status of a live session record. The only transition is `Live -> Ended`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Live,
    Ended,
}

impl SessionStatus {
    /// Returns true if the session is still live.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }

    /// Returns the wire name used in post metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Ended => "ended",
        }
    }
}

/// Recording progress of a live session.
///
/// Progression is monotonic in the order the variants are declared.
/// `Ready`, `Failed` and `Stopped` are terminal; `Stopped` means the
/// broadcast ended with nothing to show.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    #[default]
    Idle,
    Acquiring,
    Starting,
    Recording,
    Stopping,
    Compressing,
    Processing,
    Ready,
    Failed,
    Stopped,
}

impl RecordingStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Acquiring => 1,
            Self::Starting => 2,
            Self::Recording => 3,
            Self::Stopping => 4,
            Self::Compressing => 5,
            Self::Processing => 6,
            Self::Ready | Self::Failed | Self::Stopped => 7,
        }
    }

    /// Returns true for `Ready`, `Failed` and `Stopped`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Stopped)
    }

    /// Returns true if moving from `self` to `next` keeps the progression
    /// monotonic. Re-asserting the current non-terminal status is allowed.
    pub fn can_advance_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return self == next;
        }
        next.rank() >= self.rank()
    }

    /// Returns the wire name of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Acquiring => "acquiring",
            Self::Starting => "starting",
            Self::Recording => "recording",
            Self::Stopping => "stopping",
            Self::Compressing => "compressing",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

/// Error categories shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    PermissionDenied,
    DeviceNotFound,
    Network,
    Timeout,
    TokenExpired,
    CaptureEmpty,
    CompressionFailed,
    UploadFailed,
    Other,
}

impl ErrorKind {
    /// Message shown to the user for this kind of error.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Camera or microphone access was denied. Allow access in your browser settings."
            }
            Self::DeviceNotFound => "No camera or microphone was found.",
            Self::Network => "Network problem. Check your connection and try again.",
            Self::Timeout => "The connection timed out. Please try again.",
            Self::TokenExpired => "Your session credential expired. Reconnecting…",
            Self::CaptureEmpty => "Nothing was recorded, so no replay was saved.",
            Self::CompressionFailed => "The replay could not be processed.",
            Self::UploadFailed => "The replay could not be uploaded.",
            Self::Other => "Something went wrong.",
        }
    }

    /// Returns true if retrying the operation may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::TokenExpired)
    }
}

/// Stage-labelled status shown on the host page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum HostStatus {
    #[default]
    Idle,
    Connecting,
    Live,
    Reconnecting { attempt: u32 },
    Compressing { progress: f32 },
    Uploading { progress: f32 },
    Ready { playback_url: String },
    Failed { kind: ErrorKind, reason: String },
    Ended,
}

impl HostStatus {
    /// Returns a simple string representation of the status.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Live => "Live",
            Self::Reconnecting { .. } => "Reconnecting",
            Self::Compressing { .. } => "Compressing",
            Self::Uploading { .. } => "Uploading",
            Self::Ready { .. } => "Ready",
            Self::Failed { .. } => "Failed",
            Self::Ended => "Ended",
        }
    }

    /// Returns the label rendered in the host status bar.
    pub fn label(&self) -> String {
        match self {
            Self::Idle => "Not live".to_string(),
            Self::Connecting => "Connecting…".to_string(),
            Self::Live => "Live".to_string(),
            Self::Reconnecting { attempt } => format!("Reconnecting (attempt {attempt})…"),
            Self::Compressing { progress } => format!("Compressing {:.0}%", progress * 100.0),
            Self::Uploading { progress } => format!("Uploading {:.0}%", progress * 100.0),
            Self::Ready { .. } => "Replay ready".to_string(),
            Self::Failed { reason, .. } => format!("Failed: {reason}"),
            Self::Ended => "Broadcast ended".to_string(),
        }
    }
}

/// Composite status shown on the audience page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudienceStatus {
    #[default]
    Disconnected,
    Connecting,
    WaitingForHost,
    Watching,
    Reconnecting,
    Ended,
}

impl AudienceStatus {
    /// Returns the single status string rendered for viewers.
    pub fn label(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting…",
            Self::WaitingForHost => "Waiting for host…",
            Self::Watching => "Live",
            Self::Reconnecting => "Reconnecting…",
            Self::Ended => "Host ended the session",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_status_moves_forward_only() {
        assert!(RecordingStatus::Idle.can_advance_to(RecordingStatus::Recording));
        assert!(RecordingStatus::Recording.can_advance_to(RecordingStatus::Failed));
        assert!(RecordingStatus::Compressing.can_advance_to(RecordingStatus::Compressing));
        assert!(!RecordingStatus::Compressing.can_advance_to(RecordingStatus::Recording));
    }

    #[test]
    fn terminal_recording_status_is_sticky() {
        assert!(!RecordingStatus::Ready.can_advance_to(RecordingStatus::Failed));
        assert!(!RecordingStatus::Stopped.can_advance_to(RecordingStatus::Ready));
        assert!(RecordingStatus::Failed.can_advance_to(RecordingStatus::Failed));
    }

    #[test]
    fn host_status_labels_include_progress() {
        assert_eq!(HostStatus::Uploading { progress: 0.5 }.label(), "Uploading 50%");
        assert_eq!(AudienceStatus::Ended.label(), "Host ended the session");
    }
}
