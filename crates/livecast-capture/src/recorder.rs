//! Capture recorder state machine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::error::CaptureError;
use crate::segment::{CapturedSegment, RecordingArtifact};
use crate::source::{negotiate_mime_type, MediaSource, SourceMessage};
use crate::CaptureResult;

/// How often the collector thread checks for a stop request.
const COLLECT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Recorder lifecycle: `Idle -> Starting -> Recording -> Stopping -> Stopped`.
/// `Failed` is reachable from any state and is terminal for the instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RecorderState {
    #[default]
    Idle,
    Starting,
    Recording,
    Stopping,
    Stopped,
    Failed { reason: String },
}

impl RecorderState {
    pub fn is_recording(&self) -> bool {
        matches!(self, Self::Recording)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting",
            Self::Recording => "Recording",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Failed { .. } => "Failed",
        }
    }
}

/// Records a [`MediaSource`] into memory.
pub struct CaptureRecorder {
    source: Mutex<Box<dyn MediaSource>>,
    state: Arc<RwLock<RecorderState>>,
    segments: Arc<Mutex<Vec<CapturedSegment>>>,
    bytes_captured: Arc<AtomicU64>,
    mime_type: RwLock<Option<&'static str>>,
    started_at: Mutex<Option<Instant>>,
    collector: Mutex<Option<JoinHandle<()>>>,
    should_stop: Arc<AtomicBool>,
}

impl CaptureRecorder {
    /// Create a recorder for the given source. Nothing is captured until
    /// [`start`](Self::start) is called.
    pub fn new(source: Box<dyn MediaSource>) -> Self {
        Self {
            source: Mutex::new(source),
            state: Arc::new(RwLock::new(RecorderState::Idle)),
            segments: Arc::new(Mutex::new(Vec::new())),
            bytes_captured: Arc::new(AtomicU64::new(0)),
            mime_type: RwLock::new(None),
            started_at: Mutex::new(None),
            collector: Mutex::new(None),
            should_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start recording. A no-op if already starting or recording.
    #[instrument(name = "recorder_start", skip(self))]
    pub fn start(&self) -> CaptureResult<()> {
        {
            let mut state = self.state.write();
            match &*state {
                RecorderState::Starting | RecorderState::Recording => {
                    debug!("Already recording, ignoring start");
                    return Ok(());
                }
                RecorderState::Idle => *state = RecorderState::Starting,
                RecorderState::Stopping | RecorderState::Stopped | RecorderState::Failed { .. } => {
                    return Err(CaptureError::AlreadyFinished);
                }
            }
        }

        let receiver = {
            let mut source = self.source.lock();
            let started = negotiate_mime_type(source.as_ref()).and_then(|mime| {
                *self.mime_type.write() = Some(mime);
                source.start(mime)
            });
            match started {
                Ok(receiver) => receiver,
                Err(e) => {
                    warn!("Capture start failed: {}", e);
                    self.fail(e.to_string());
                    return Err(e);
                }
            }
        };

        *self.started_at.lock() = Some(Instant::now());
        self.should_stop.store(false, Ordering::SeqCst);

        let state = Arc::clone(&self.state);
        let segments = Arc::clone(&self.segments);
        let bytes = Arc::clone(&self.bytes_captured);
        let should_stop = Arc::clone(&self.should_stop);
        let handle = thread::spawn(move || {
            collect_segments(receiver, state, segments, bytes, should_stop);
        });
        *self.collector.lock() = Some(handle);

        let mut state = self.state.write();
        if matches!(*state, RecorderState::Starting) {
            *state = RecorderState::Recording;
        }
        info!(mime_type = ?*self.mime_type.read(), "Recording started");
        Ok(())
    }

    /// Stop recording and return whatever was captured.
    ///
    /// Never fails: stopping an idle recorder yields an empty artifact,
    /// and a failed recorder yields the segments captured before the
    /// failure.
    #[instrument(name = "recorder_stop", skip(self))]
    pub fn stop(&self) -> RecordingArtifact {
        let was_running = {
            let mut state = self.state.write();
            match &*state {
                RecorderState::Starting | RecorderState::Recording => {
                    *state = RecorderState::Stopping;
                    true
                }
                _ => false,
            }
        };

        if was_running {
            if let Err(e) = self.source.lock().stop() {
                warn!("Source stop failed: {}", e);
            }
        }

        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.collector.lock().take() {
            let _ = handle.join();
        }

        if was_running {
            let mut state = self.state.write();
            if matches!(*state, RecorderState::Stopping) {
                *state = RecorderState::Stopped;
            }
        }

        let duration = self
            .started_at
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let mime_type = self.mime_type().unwrap_or(crate::PREFERRED_MIME_TYPES[0]);
        let segments = std::mem::take(&mut *self.segments.lock());
        let artifact = RecordingArtifact::from_segments(segments, mime_type, duration);

        info!(
            bytes = artifact.byte_size(),
            segments = artifact.segment_count,
            state = self.state.read().name(),
            "Recording stopped"
        );
        artifact
    }

    /// Current recorder state.
    pub fn state(&self) -> RecorderState {
        self.state.read().clone()
    }

    /// Bytes captured so far.
    pub fn byte_size(&self) -> u64 {
        self.bytes_captured.load(Ordering::Relaxed)
    }

    /// Negotiated container/codec, once started.
    pub fn mime_type(&self) -> Option<&'static str> {
        *self.mime_type.read()
    }

    fn fail(&self, reason: String) {
        *self.state.write() = RecorderState::Failed { reason };
    }
}

impl Drop for CaptureRecorder {
    fn drop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if self.source.get_mut().is_active() {
            if let Err(e) = self.source.get_mut().stop() {
                warn!("Source stop on drop failed: {}", e);
            }
        }
        if let Some(handle) = self.collector.get_mut().take() {
            let _ = handle.join();
        }
    }
}

/// Drain segments until the source disconnects, fails, or a stop is
/// requested. Segments already queued when the stop is seen are kept.
fn collect_segments(
    receiver: Receiver<SourceMessage>,
    state: Arc<RwLock<RecorderState>>,
    segments: Arc<Mutex<Vec<CapturedSegment>>>,
    bytes: Arc<AtomicU64>,
    should_stop: Arc<AtomicBool>,
) {
    debug!("Segment collector starting");

    let keep = |message: SourceMessage| match message {
        SourceMessage::Segment(segment) => {
            bytes.fetch_add(segment.data.len() as u64, Ordering::Relaxed);
            segments.lock().push(segment);
            true
        }
        SourceMessage::Failed(reason) => {
            warn!(%reason, "Capture source failed");
            *state.write() = RecorderState::Failed { reason };
            false
        }
    };

    loop {
        if should_stop.load(Ordering::SeqCst) {
            // Bounded so a source that never stops cannot keep us here.
            let queued = receiver.len();
            for message in receiver.try_iter().take(queued) {
                if !keep(message) {
                    break;
                }
            }
            break;
        }

        match receiver.recv_timeout(COLLECT_POLL_INTERVAL) {
            Ok(message) => {
                if !keep(message) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Segment channel disconnected");
                break;
            }
        }
    }

    debug!(count = segments.lock().len(), "Segment collector stopped");
}
