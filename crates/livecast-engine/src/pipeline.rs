//! End-of-broadcast recording pipeline.
//!
//! Stop capture, compress, extract a thumbnail, upload, finalize. Every
//! stage before finalize is fail-soft: a failure loses the replay but
//! the session still ends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use crossbeam_channel::Sender;
use livecast_capture::{file_extension, CaptureRecorder};
use livecast_ipc::{
    BroadcastEvent, ErrorKind, LiveSession, PipelineSettings, PipelineStage, RecordingStatus,
    SessionId,
};
use livecast_store::{upload, ObjectStorage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::error::EngineError;
use crate::lifecycle::{FinalizeRequest, LifecycleService};
use crate::EngineResult;

/// Fractional progress callback (0.0 - 1.0).
pub type StageProgress<'a> = &'a (dyn Fn(f32) + Send + Sync);

/// Receives every progress report of a pipeline run.
pub type PipelineObserver = Arc<dyn Fn(PipelineStage, f32) + Send + Sync>;

/// Media bytes moving between stages.
#[derive(Debug, Clone)]
pub struct MediaBlob {
    pub data: Bytes,
    pub mime_type: String,
    pub duration: Duration,
}

/// Compresses a raw capture for upload.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn compress(&self, input: MediaBlob, progress: StageProgress<'_>)
        -> EngineResult<MediaBlob>;
}

/// Pulls a JPEG frame out of compressed media.
#[async_trait]
pub trait ThumbnailExtractor: Send + Sync {
    async fn extract(&self, media: &MediaBlob, at: Duration) -> EngineResult<Bytes>;
}

/// Hands the capture through unchanged, in chunks.
pub struct PassthroughTranscoder {
    chunk_bytes: usize,
}

impl PassthroughTranscoder {
    pub fn new(chunk_bytes: usize) -> Self {
        Self {
            chunk_bytes: chunk_bytes.max(1),
        }
    }
}

impl Default for PassthroughTranscoder {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

#[async_trait]
impl Transcoder for PassthroughTranscoder {
    async fn compress(
        &self,
        input: MediaBlob,
        progress: StageProgress<'_>,
    ) -> EngineResult<MediaBlob> {
        if input.data.is_empty() {
            return Err(EngineError::Transcode("empty input".to_string()));
        }

        let total = input.data.len();
        let mut done = 0usize;
        progress(0.0);
        for chunk in input.data.chunks(self.chunk_bytes) {
            done += chunk.len();
            progress(done as f32 / total as f32);
            tokio::task::yield_now().await;
        }
        Ok(input)
    }
}

/// Wraps the bytes at the sample point in JPEG markers. Stands in for a
/// decoder in demos and tests.
pub struct SampleThumbnailer {
    frame_bytes: usize,
}

impl Default for SampleThumbnailer {
    fn default() -> Self {
        Self { frame_bytes: 64 }
    }
}

#[async_trait]
impl ThumbnailExtractor for SampleThumbnailer {
    async fn extract(&self, media: &MediaBlob, at: Duration) -> EngineResult<Bytes> {
        if media.data.is_empty() {
            return Err(EngineError::Thumbnail("no frames".to_string()));
        }

        let len = media.data.len();
        let start = if media.duration.is_zero() {
            0
        } else {
            let fraction = (at.as_secs_f64() / media.duration.as_secs_f64()).clamp(0.0, 1.0);
            ((len as f64 * fraction) as usize).min(len - 1)
        };
        let end = (start + self.frame_bytes).min(len);

        let mut jpeg = BytesMut::with_capacity(end - start + 4);
        jpeg.put_slice(&[0xFF, 0xD8]);
        jpeg.put_slice(&media.data[start..end]);
        jpeg.put_slice(&[0xFF, 0xD9]);
        Ok(jpeg.freeze())
    }
}

/// Collaborators of a pipeline run.
#[derive(Clone)]
pub struct PipelineDeps {
    /// Must act as the session host.
    pub lifecycle: LifecycleService,
    pub storage: Arc<dyn ObjectStorage>,
    pub transcoder: Arc<dyn Transcoder>,
    pub thumbnails: Arc<dyn ThumbnailExtractor>,
}

/// Why a replay was not saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFailure {
    pub kind: ErrorKind,
    pub reason: String,
}

impl PipelineFailure {
    fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Result of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub recording_status: RecordingStatus,
    pub playback_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub failure: Option<PipelineFailure>,

    /// The ended session, unless finalize itself failed.
    pub session: Option<LiveSession>,
}

struct Produced {
    playback_url: Url,
    thumbnail_url: Option<Url>,
}

/// Runs the recording pipeline for one session.
pub struct RecordingPipeline {
    session_id: SessionId,
    deps: PipelineDeps,
    settings: PipelineSettings,
    events: Option<Sender<BroadcastEvent>>,
    observer: Option<PipelineObserver>,
    token: CancellationToken,
}

impl RecordingPipeline {
    pub fn new(session_id: SessionId, deps: PipelineDeps, settings: PipelineSettings) -> Self {
        Self {
            session_id,
            deps,
            settings,
            events: None,
            observer: None,
            token: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: Sender<BroadcastEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_observer(mut self, observer: PipelineObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Cancelling skips the remaining media stages. Finalize still runs.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Produce and attach the replay, then end the session.
    #[instrument(name = "pipeline_run", skip(self, recorder), fields(session_id = %self.session_id))]
    pub async fn run(&self, recorder: Option<Arc<CaptureRecorder>>) -> PipelineOutcome {
        info!("Recording pipeline starting");

        let produced = tokio::select! {
            _ = self.token.cancelled() => Err(PipelineFailure::new(ErrorKind::Other, "cancelled")),
            result = self.produce(recorder) => result,
        };

        let (request, failure) = match produced {
            Ok(produced) => (
                FinalizeRequest {
                    recording_status: RecordingStatus::Ready,
                    playback_url: Some(produced.playback_url.to_string()),
                    thumbnail_url: produced.thumbnail_url.map(String::from),
                },
                None,
            ),
            Err(failure) => {
                warn!(kind = ?failure.kind, reason = %failure.reason, "Replay not saved");
                (FinalizeRequest::failed(), Some(failure))
            }
        };

        self.report(PipelineStage::Finalize, 0.0);
        let session = match self
            .deps
            .lifecycle
            .finalize(self.session_id, request.clone())
            .await
        {
            Ok(session) => Some(session),
            Err(e) => {
                error!("Finalize failed: {}", e);
                None
            }
        };
        self.report(PipelineStage::Finalize, 1.0);

        info!(
            recording_status = request.recording_status.as_str(),
            "Recording pipeline finished"
        );
        PipelineOutcome {
            recording_status: request.recording_status,
            playback_url: request.playback_url,
            thumbnail_url: request.thumbnail_url,
            failure,
            session,
        }
    }

    async fn produce(
        &self,
        recorder: Option<Arc<CaptureRecorder>>,
    ) -> Result<Produced, PipelineFailure> {
        let Some(recorder) = recorder.filter(|r| r.state().is_recording()) else {
            return Err(PipelineFailure::new(
                ErrorKind::CaptureEmpty,
                "no active recording",
            ));
        };

        self.report(PipelineStage::StopCapture, 0.0);
        self.advance(RecordingStatus::Stopping).await;
        let artifact = tokio::task::spawn_blocking(move || recorder.stop())
            .await
            .map_err(|e| PipelineFailure::new(ErrorKind::Other, format!("capture stop: {}", e)))?;
        self.report(PipelineStage::StopCapture, 1.0);
        if artifact.is_empty() {
            return Err(PipelineFailure::new(
                ErrorKind::CaptureEmpty,
                "nothing was recorded",
            ));
        }
        info!(
            bytes = artifact.byte_size(),
            segments = artifact.segment_count,
            "Capture stopped"
        );

        self.advance(RecordingStatus::Compressing).await;
        let raw = MediaBlob {
            data: artifact.data,
            mime_type: artifact.mime_type,
            duration: artifact.duration,
        };
        let compress_progress = |p: f32| self.report(PipelineStage::Compress, p);
        let compressed = self
            .deps
            .transcoder
            .compress(raw, &compress_progress)
            .await
            .map_err(|e| PipelineFailure::new(ErrorKind::CompressionFailed, e.to_string()))?;
        info!(bytes = compressed.data.len(), "Compressed");

        let offset = self.settings.thumbnail_offset(compressed.duration);
        let thumbnail = match self.deps.thumbnails.extract(&compressed, offset).await {
            Ok(jpeg) => Some(jpeg),
            Err(e) => {
                warn!("Thumbnail extraction failed: {}", e);
                None
            }
        };
        self.report(PipelineStage::Thumbnail, 1.0);

        self.advance(RecordingStatus::Processing).await;
        let key = format!(
            "{}/{}.{}",
            self.settings.recordings_prefix,
            self.session_id,
            file_extension(&compressed.mime_type)
        );
        let upload_progress = |sent: u64, total: u64| {
            let fraction = if total == 0 {
                1.0
            } else {
                sent as f32 / total as f32
            };
            self.report(PipelineStage::Upload, fraction);
        };
        let playback_url = upload(
            self.deps.storage.as_ref(),
            &key,
            &compressed.mime_type,
            compressed.data,
            self.settings.upload_chunk_bytes,
            &upload_progress,
        )
        .await
        .map_err(|e| PipelineFailure::new(ErrorKind::UploadFailed, e.to_string()))?;

        let thumbnail_url = match thumbnail {
            Some(jpeg) => {
                let key = format!("{}/{}.jpg", self.settings.recordings_prefix, self.session_id);
                let chunk_bytes = self.settings.upload_chunk_bytes;
                match upload(self.deps.storage.as_ref(), &key, "image/jpeg", jpeg, chunk_bytes, &|_, _| {}).await {
                    Ok(url) => Some(url),
                    Err(e) => {
                        warn!("Thumbnail upload failed: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        Ok(Produced {
            playback_url,
            thumbnail_url,
        })
    }

    async fn advance(&self, status: RecordingStatus) {
        if let Err(e) = self
            .deps
            .lifecycle
            .set_recording_status(self.session_id, status)
            .await
        {
            warn!(status = status.as_str(), "Recording status write failed: {}", e);
        }
    }

    fn report(&self, stage: PipelineStage, progress: f32) {
        debug!(stage = stage.name(), progress, "Pipeline progress");
        if let Some(observer) = &self.observer {
            observer(stage, progress);
        }
        self.send_event(BroadcastEvent::PipelineProgress { stage, progress });
    }

    fn send_event(&self, event: BroadcastEvent) {
        if let Some(tx) = &self.events {
            if let Err(e) = tx.try_send(event) {
                warn!("Failed to send event: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecast_capture::{ChannelSource, SourceFeed};
    use livecast_ipc::{Actor, Post, Privacy, SessionStatus, StoreSettings};
    use livecast_store::{MemoryObjectStorage, MemoryTable};
    use parking_lot::Mutex;

    use crate::tokens::LoopbackTokenIssuer;

    struct Fixture {
        lifecycle: LifecycleService,
        storage: Arc<MemoryObjectStorage>,
        session: LiveSession,
    }

    async fn fixture() -> Fixture {
        let lifecycle = LifecycleService::new(
            Arc::new(MemoryTable::<LiveSession>::new("live_sessions")),
            Arc::new(MemoryTable::<Post>::new("posts")),
            Arc::new(LoopbackTokenIssuer::default()),
            &StoreSettings::default(),
        )
        .with_actor(Actor::new("host"));
        let session = lifecycle.create("Q&A", Privacy::Public).await.unwrap();
        let storage = Arc::new(MemoryObjectStorage::new(
            Url::parse("https://cdn.example.com/").unwrap(),
        ));
        Fixture {
            lifecycle,
            storage,
            session,
        }
    }

    fn pipeline(f: &Fixture, transcoder: Arc<dyn Transcoder>) -> RecordingPipeline {
        RecordingPipeline::new(
            f.session.id,
            PipelineDeps {
                lifecycle: f.lifecycle.clone(),
                storage: f.storage.clone(),
                transcoder,
                thumbnails: Arc::new(SampleThumbnailer::default()),
            },
            PipelineSettings {
                upload_chunk_bytes: 4,
                ..PipelineSettings::default()
            },
        )
    }

    fn recording(chunks: &[&'static [u8]]) -> (Arc<CaptureRecorder>, SourceFeed) {
        let (source, feed) = ChannelSource::new(&["video/webm"]);
        let recorder = Arc::new(CaptureRecorder::new(Box::new(source)));
        recorder.start().unwrap();
        for chunk in chunks {
            feed.push(*chunk).unwrap();
        }
        (recorder, feed)
    }

    struct FailingTranscoder;

    #[async_trait]
    impl Transcoder for FailingTranscoder {
        async fn compress(&self, _: MediaBlob, _: StageProgress<'_>) -> EngineResult<MediaBlob> {
            Err(EngineError::Transcode("codec crashed".to_string()))
        }
    }

    #[tokio::test]
    async fn uploads_and_attaches_replay() {
        let f = fixture().await;
        let (recorder, _feed) = recording(&[b"0123", b"4567", b"89"]);
        let stages = Arc::new(Mutex::new(Vec::new()));
        let seen = stages.clone();

        let outcome = pipeline(&f, Arc::new(PassthroughTranscoder::new(4)))
            .with_observer(Arc::new(move |stage, progress| seen.lock().push((stage, progress))))
            .run(Some(recorder))
            .await;

        let key = format!("recordings/{}.webm", f.session.id);
        assert_eq!(outcome.recording_status, RecordingStatus::Ready);
        assert_eq!(f.storage.object(&key).unwrap(), Bytes::from_static(b"0123456789"));
        assert!(outcome.thumbnail_url.is_some());

        let session = outcome.session.unwrap();
        assert_eq!(session.status, SessionStatus::Ended);
        assert_eq!(session.playback_url, outcome.playback_url);

        let post = f.lifecycle.get_post(session.post_id).await.unwrap().unwrap();
        assert_eq!(post.video_url, outcome.playback_url);
        assert_eq!(post.thumbnail_url, outcome.thumbnail_url);

        let stages = stages.lock();
        assert!(stages.contains(&(PipelineStage::Compress, 1.0)));
        let uploads: Vec<f32> = stages
            .iter()
            .filter(|(stage, _)| *stage == PipelineStage::Upload)
            .map(|(_, progress)| *progress)
            .collect();
        assert_eq!(uploads, vec![0.0, 0.4, 0.8, 1.0]);
        assert_eq!(stages.last(), Some(&(PipelineStage::Finalize, 1.0)));
    }

    #[tokio::test]
    async fn missing_recorder_still_ends_session() {
        let f = fixture().await;
        let outcome = pipeline(&f, Arc::new(PassthroughTranscoder::default()))
            .run(None)
            .await;

        assert_eq!(outcome.recording_status, RecordingStatus::Failed);
        assert_eq!(outcome.failure.unwrap().reason, "no active recording");
        assert!(outcome.session.unwrap().ended_at.is_some());
        assert!(f.storage.is_empty());
    }

    #[tokio::test]
    async fn compression_failure_ends_session_failed() {
        let f = fixture().await;
        let (recorder, _feed) = recording(&[b"data"]);

        let outcome = pipeline(&f, Arc::new(FailingTranscoder)).run(Some(recorder)).await;

        assert_eq!(
            outcome.failure.map(|failure| failure.kind),
            Some(ErrorKind::CompressionFailed)
        );
        let session = outcome.session.unwrap();
        assert_eq!(session.recording_status, RecordingStatus::Failed);
        assert_eq!(session.status, SessionStatus::Ended);
        assert!(f.storage.is_empty());
    }

    #[tokio::test]
    async fn upload_failure_ends_session_failed() {
        let f = fixture().await;
        f.storage.fail_next_puts(1);
        let (recorder, _feed) = recording(&[b"0123456789"]);

        let outcome = pipeline(&f, Arc::new(PassthroughTranscoder::default()))
            .run(Some(recorder))
            .await;

        assert_eq!(
            outcome.failure.map(|failure| failure.kind),
            Some(ErrorKind::UploadFailed)
        );
        assert_eq!(outcome.playback_url, None);
        let post = f
            .lifecycle
            .get_post(f.session.post_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(post.video_url, None);
    }

    #[tokio::test]
    async fn thumbnail_sample_is_framed_as_jpeg() {
        let media = MediaBlob {
            data: Bytes::from_static(b"abcdefghij"),
            mime_type: "video/webm".to_string(),
            duration: Duration::from_secs(10),
        };
        let jpeg = SampleThumbnailer { frame_bytes: 2 }
            .extract(&media, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(&jpeg[..], &[0xFF, 0xD8, b'f', b'g', 0xFF, 0xD9]);
    }
}
