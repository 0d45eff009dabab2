//! Core of live broadcast sessions.
//!
//! This crate ties the durable session and post records, viewer presence,
//! the end-of-broadcast recording pipeline, and the host and audience page
//! controllers to the transport and capture crates.

mod cache;
mod error;
mod host;
mod ids;
mod lifecycle;
mod pipeline;
mod presence;
mod tokens;
mod viewer;

pub use cache::SessionCache;
pub use error::EngineError;
pub use host::{HostBroadcast, HostDeps};
pub use ids::{audience_uid, channel_id, host_uid, recorder_uid, share_url};
pub use lifecycle::{FinalizeRequest, LifecycleService};
pub use pipeline::{
    MediaBlob, PassthroughTranscoder, PipelineDeps, PipelineFailure, PipelineObserver,
    PipelineOutcome, RecordingPipeline, SampleThumbnailer, StageProgress, ThumbnailExtractor,
    Transcoder,
};
pub use presence::{AudiencePresence, PresenceLedger, PresenceStore, ViewerCountSyncer};
pub use tokens::{LoopbackTokenIssuer, TokenIssuer};
pub use viewer::{ViewerDeps, ViewerSession};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
