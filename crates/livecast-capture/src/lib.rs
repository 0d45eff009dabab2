//! Local capture recorder for live broadcasts.
//!
//! Wraps a local media stream into a start/stop/result contract. The
//! recorder accumulates encoded segments emitted by a [`MediaSource`] and
//! hands them back as a single [`RecordingArtifact`] when stopped.

mod error;
mod recorder;
mod segment;
mod source;

pub use error::CaptureError;
pub use recorder::{CaptureRecorder, RecorderState};
pub use segment::{file_extension, CapturedSegment, RecordingArtifact};
pub use source::{
    negotiate_mime_type, ChannelSource, MediaSource, SourceFeed, SourceMessage, SyntheticSource,
    PREFERRED_MIME_TYPES,
};

/// Channel capacity for captured segments.
pub const SEGMENT_CHANNEL_CAPACITY: usize = 64;

/// Result type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;
