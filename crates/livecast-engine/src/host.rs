//! Host page controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use livecast_capture::CaptureRecorder;
use livecast_ipc::{
    BroadcastEvent, ErrorKind, HostStatus, LiveSession, LivecastConfig, PipelineStage, Privacy,
    RecordingStatus, Role,
};
use livecast_store::ObjectStorage;
use livecast_transport::{
    ConnectionDeps, ConnectionManager, ConnectionOptions, ConnectionState, MediaDevices, RtcClient,
    ViewerCountCallback,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::error::EngineError;
use crate::ids::share_url;
use crate::lifecycle::{FinalizeRequest, LifecycleService};
use crate::pipeline::{
    PipelineDeps, PipelineFailure, PipelineObserver, PipelineOutcome, RecordingPipeline,
    ThumbnailExtractor, Transcoder,
};
use crate::presence::ViewerCountSyncer;
use crate::EngineResult;

/// Collaborators of a host page.
pub struct HostDeps {
    /// Acting as the host.
    pub lifecycle: LifecycleService,
    pub client: Arc<dyn RtcClient>,
    pub devices: Arc<dyn MediaDevices>,
    pub storage: Arc<dyn ObjectStorage>,
    pub transcoder: Arc<dyn Transcoder>,
    pub thumbnails: Arc<dyn ThumbnailExtractor>,
    pub config: LivecastConfig,
    pub events: Option<Sender<BroadcastEvent>>,
}

struct HostShared {
    status_tx: watch::Sender<HostStatus>,
    ending: AtomicBool,
    events: Option<Sender<BroadcastEvent>>,
}

impl HostShared {
    fn transition_to(&self, status: HostStatus) {
        let previous = self.status_tx.send_replace(status.clone());
        if previous == status {
            return;
        }

        debug!(
            previous = %previous.name(),
            current = %status.name(),
            "Host status transition"
        );
        self.send_event(BroadcastEvent::HostStatusChanged {
            previous: Box::new(previous),
            current: Box::new(status),
        });
    }

    fn send_event(&self, event: BroadcastEvent) {
        if let Some(tx) = &self.events {
            if let Err(e) = tx.try_send(event) {
                warn!("Failed to send event: {}", e);
            }
        }
    }
}

/// One broadcast from the host's side: go live, record, end.
pub struct HostBroadcast {
    session: LiveSession,
    lifecycle: LifecycleService,
    storage: Arc<dyn ObjectStorage>,
    transcoder: Arc<dyn Transcoder>,
    thumbnails: Arc<dyn ThumbnailExtractor>,
    config: LivecastConfig,
    manager: Arc<ConnectionManager>,
    syncer: Arc<ViewerCountSyncer>,
    recorder: Mutex<Option<Arc<CaptureRecorder>>>,
    starting: AtomicBool,
    shared: Arc<HostShared>,
    token: CancellationToken,
}

struct StartGuard<'a>(&'a AtomicBool);

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl HostBroadcast {
    /// Create the session and its post, and prepare the connection.
    /// Nothing is joined until [`start`](Self::start).
    #[instrument(name = "host_create", skip(deps))]
    pub async fn create(title: &str, privacy: Privacy, deps: HostDeps) -> EngineResult<Self> {
        let session = deps.lifecycle.create(title, privacy).await?;
        let shared = Arc::new(HostShared {
            status_tx: watch::channel(HostStatus::Idle).0,
            ending: AtomicBool::new(false),
            events: deps.events,
        });
        shared.send_event(BroadcastEvent::SessionStarted {
            session_id: session.id,
            channel: session.channel.clone(),
        });

        let syncer = Arc::new(ViewerCountSyncer::spawn(
            Arc::new(deps.lifecycle.clone()),
            session.id,
            deps.config.presence.debounce(),
        ));
        let viewer_count: ViewerCountCallback = {
            let syncer = Arc::clone(&syncer);
            let shared = Arc::clone(&shared);
            Arc::new(move |count: u32| {
                syncer.report(count);
                shared.send_event(BroadcastEvent::ViewerCount(count));
            })
        };

        let mut options = ConnectionOptions::from_config(session.id, Role::Host, &deps.config);
        options.ignored_uids.extend(session.recorder_uid);
        let manager = Arc::new(ConnectionManager::new(
            options,
            ConnectionDeps {
                client: deps.client,
                credentials: Arc::new(deps.lifecycle.clone()),
                devices: Some(deps.devices),
                viewer_count: Some(viewer_count),
                events: None,
            },
        ));

        let token = CancellationToken::new();
        tokio::spawn(follow_connection(
            Arc::clone(&shared),
            manager.watch_state(),
            token.clone(),
        ));

        Ok(Self {
            session,
            lifecycle: deps.lifecycle,
            storage: deps.storage,
            transcoder: deps.transcoder,
            thumbnails: deps.thumbnails,
            config: deps.config,
            manager,
            syncer,
            recorder: Mutex::new(None),
            starting: AtomicBool::new(false),
            shared,
            token,
        })
    }

    /// Join as host, publish, and start recording the published tracks.
    /// A recording failure does not stop the broadcast. Starting a
    /// broadcast that is already live or starting is a no-op.
    #[instrument(name = "host_start", skip(self), fields(session_id = %self.session.id))]
    pub async fn start(&self) -> EngineResult<()> {
        if self.shared.ending.load(Ordering::SeqCst) {
            return Err(EngineError::SessionEnded(self.session.id));
        }
        if self.starting.swap(true, Ordering::SeqCst) {
            debug!("Start already in flight");
            return Ok(());
        }
        let _guard = StartGuard(&self.starting);
        if self.is_recording() {
            debug!("Already live, ignoring start");
            return Ok(());
        }

        self.advance(RecordingStatus::Acquiring).await;
        self.shared.transition_to(HostStatus::Connecting);
        if let Err(e) = self.manager.start().await {
            error!("Going live failed: {}", e);
            self.shared.transition_to(HostStatus::Failed {
                kind: e.kind(),
                reason: e.user_message(),
            });
            self.shared.send_event(BroadcastEvent::Error {
                kind: e.kind(),
                message: e.user_message(),
            });
            return Err(e.into());
        }

        match self.manager.local_tracks() {
            Some(tracks) => {
                self.advance(RecordingStatus::Starting).await;
                let recorder = Arc::new(CaptureRecorder::new(tracks.capture_source()));
                match recorder.start() {
                    Ok(()) => {
                        self.advance(RecordingStatus::Recording).await;
                        *self.recorder.lock() = Some(recorder);
                    }
                    Err(e) => warn!("Recording unavailable, broadcasting without replay: {}", e),
                }
            }
            None => warn!("No local tracks to record"),
        }

        self.shared.transition_to(HostStatus::Live);
        info!(channel = %self.session.channel, "Broadcast live");
        Ok(())
    }

    /// End the broadcast: run the recording pipeline in the background,
    /// then leave. The session always ends, with or without a replay.
    #[instrument(name = "host_end", skip(self), fields(session_id = %self.session.id))]
    pub async fn end(&self) -> EngineResult<PipelineOutcome> {
        if self.shared.ending.swap(true, Ordering::SeqCst) {
            return Err(EngineError::SessionEnded(self.session.id));
        }
        self.syncer.stop();

        let observer: PipelineObserver = {
            let shared = Arc::clone(&self.shared);
            Arc::new(move |stage: PipelineStage, progress: f32| match stage {
                PipelineStage::Compress => {
                    shared.transition_to(HostStatus::Compressing { progress })
                }
                PipelineStage::Upload => shared.transition_to(HostStatus::Uploading { progress }),
                _ => {}
            })
        };
        let mut pipeline = RecordingPipeline::new(
            self.session.id,
            PipelineDeps {
                lifecycle: self.lifecycle.clone(),
                storage: Arc::clone(&self.storage),
                transcoder: Arc::clone(&self.transcoder),
                thumbnails: Arc::clone(&self.thumbnails),
            },
            self.config.pipeline.clone(),
        )
        .with_observer(observer)
        .with_cancellation(self.token.child_token());
        if let Some(events) = &self.shared.events {
            pipeline = pipeline.with_events(events.clone());
        }

        let recorder = self.recorder.lock().take();
        let handle = tokio::spawn(async move { pipeline.run(recorder).await });
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Recording pipeline task failed: {}", e);
                self.finalize_without_replay(RecordingStatus::Failed, e.to_string())
                    .await
            }
        };

        self.manager.leave().await;
        self.shared.transition_to(host_status_for(&outcome));
        if outcome.session.is_some() {
            self.shared.send_event(BroadcastEvent::SessionEnded {
                session_id: self.session.id,
            });
        }
        self.token.cancel();

        info!(
            recording_status = outcome.recording_status.as_str(),
            "Broadcast ended"
        );
        Ok(outcome)
    }

    /// Abandon the broadcast. Work in flight is cancelled and a session
    /// that was not being ended is closed with nothing to show.
    #[instrument(name = "host_cancel", skip(self), fields(session_id = %self.session.id))]
    pub async fn cancel(&self) {
        self.token.cancel();
        self.syncer.stop();
        if !self.shared.ending.swap(true, Ordering::SeqCst) {
            let recorder = self.recorder.lock().take();
            if let Some(recorder) = recorder {
                if let Err(e) = tokio::task::spawn_blocking(move || recorder.stop()).await {
                    warn!("Discarding capture failed: {}", e);
                }
            }
            self.finalize_without_replay(RecordingStatus::Stopped, "cancelled")
                .await;
            self.shared.transition_to(HostStatus::Ended);
        }
        self.manager.leave().await;
    }

    async fn finalize_without_replay(
        &self,
        status: RecordingStatus,
        reason: impl Into<String>,
    ) -> PipelineOutcome {
        let request = FinalizeRequest {
            recording_status: status,
            playback_url: None,
            thumbnail_url: None,
        };
        let session = match self.lifecycle.finalize(self.session.id, request).await {
            Ok(session) => Some(session),
            Err(e) => {
                error!("Finalize failed: {}", e);
                None
            }
        };

        PipelineOutcome {
            recording_status: status,
            playback_url: None,
            thumbnail_url: None,
            failure: Some(PipelineFailure {
                kind: ErrorKind::Other,
                reason: reason.into(),
            }),
            session,
        }
    }

    async fn advance(&self, status: RecordingStatus) {
        if let Err(e) = self
            .lifecycle
            .set_recording_status(self.session.id, status)
            .await
        {
            warn!(status = status.as_str(), "Recording status write failed: {}", e);
        }
    }

    /// Returns true when the microphone is now muted.
    pub fn toggle_mute(&self) -> EngineResult<bool> {
        Ok(self.manager.toggle_mute()?)
    }

    /// Returns true when the camera is now off.
    pub fn toggle_camera(&self) -> EngineResult<bool> {
        Ok(self.manager.toggle_camera()?)
    }

    pub fn session(&self) -> &LiveSession {
        &self.session
    }

    pub fn status(&self) -> HostStatus {
        self.shared.status_tx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<HostStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder
            .lock()
            .as_ref()
            .is_some_and(|r| r.state().is_recording())
    }

    /// Bytes captured for the replay so far.
    pub fn recorded_bytes(&self) -> u64 {
        self.recorder.lock().as_ref().map_or(0, |r| r.byte_size())
    }

    /// Viewers in the channel as the transport sees them.
    pub fn viewer_count(&self) -> u32 {
        self.manager.remote_user_count()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn share_url(&self, base: &Url) -> EngineResult<Url> {
        share_url(base, &self.session.channel)
            .map_err(|e| EngineError::InvalidInput(format!("share url: {}", e)))
    }
}

impl Drop for HostBroadcast {
    fn drop(&mut self) {
        self.token.cancel();
        if self.shared.ending.swap(true, Ordering::SeqCst) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(session_id = %self.session.id, "No runtime to close abandoned session");
            return;
        };
        let lifecycle = self.lifecycle.clone();
        let session_id = self.session.id;
        let request = FinalizeRequest {
            recording_status: RecordingStatus::Stopped,
            playback_url: None,
            thumbnail_url: None,
        };
        handle.spawn(async move {
            if let Err(e) = lifecycle.finalize(session_id, request).await {
                warn!(%session_id, "Closing abandoned session failed: {}", e);
            }
        });
    }
}

/// Host status for a connection state while the broadcast is running.
fn host_status_for_connection(state: &ConnectionState) -> Option<HostStatus> {
    match state {
        ConnectionState::Connecting => Some(HostStatus::Connecting),
        ConnectionState::Connected => Some(HostStatus::Live),
        ConnectionState::Reconnecting { attempt } => {
            Some(HostStatus::Reconnecting { attempt: *attempt })
        }
        ConnectionState::Failed { reason } => Some(HostStatus::Failed {
            kind: ErrorKind::Network,
            reason: reason.clone(),
        }),
        ConnectionState::Disconnected => None,
    }
}

fn host_status_for(outcome: &PipelineOutcome) -> HostStatus {
    if outcome.session.is_none() {
        return HostStatus::Failed {
            kind: ErrorKind::Other,
            reason: "The broadcast could not be saved".to_string(),
        };
    }
    match (&outcome.playback_url, &outcome.failure) {
        (Some(url), None) => HostStatus::Ready {
            playback_url: url.clone(),
        },
        (_, Some(failure)) => HostStatus::Failed {
            kind: failure.kind,
            reason: failure.kind.user_message().to_string(),
        },
        (None, None) => HostStatus::Ended,
    }
}

async fn follow_connection(
    shared: Arc<HostShared>,
    mut rx: watch::Receiver<ConnectionState>,
    token: CancellationToken,
) {
    loop {
        let state = rx.borrow_and_update().clone();
        if !shared.ending.load(Ordering::SeqCst) {
            if let Some(status) = host_status_for_connection(&state) {
                shared.transition_to(status);
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            changed = rx.changed() => if changed.is_err() { break },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(
        playback_url: Option<&str>,
        failure: Option<ErrorKind>,
        ended: bool,
    ) -> PipelineOutcome {
        PipelineOutcome {
            recording_status: RecordingStatus::Ready,
            playback_url: playback_url.map(String::from),
            thumbnail_url: None,
            failure: failure.map(|kind| PipelineFailure {
                kind,
                reason: "x".to_string(),
            }),
            session: ended.then(|| LiveSession {
                id: uuid::Uuid::new_v4(),
                host_user_id: "host".to_string(),
                channel: "live_host_1".to_string(),
                host_uid: 1,
                recorder_uid: None,
                title: "t".to_string(),
                privacy: Privacy::Public,
                status: livecast_ipc::SessionStatus::Ended,
                recording_status: RecordingStatus::Ready,
                viewer_count: 0,
                started_at: chrono::Utc::now(),
                ended_at: Some(chrono::Utc::now()),
                post_id: uuid::Uuid::new_v4(),
                playback_url: None,
            }),
        }
    }

    #[test]
    fn connection_states_map_to_host_statuses() {
        assert_eq!(
            host_status_for_connection(&ConnectionState::Connected),
            Some(HostStatus::Live)
        );
        assert_eq!(
            host_status_for_connection(&ConnectionState::Reconnecting { attempt: 2 }),
            Some(HostStatus::Reconnecting { attempt: 2 })
        );
        assert_eq!(host_status_for_connection(&ConnectionState::Disconnected), None);
    }

    #[test]
    fn outcome_maps_to_final_status() {
        assert_eq!(
            host_status_for(&outcome(Some("https://cdn/x.webm"), None, true)),
            HostStatus::Ready {
                playback_url: "https://cdn/x.webm".to_string()
            }
        );
        assert!(matches!(
            host_status_for(&outcome(None, Some(ErrorKind::CaptureEmpty), true)),
            HostStatus::Failed {
                kind: ErrorKind::CaptureEmpty,
                ..
            }
        ));
        assert!(matches!(
            host_status_for(&outcome(Some("https://cdn/x.webm"), None, false)),
            HostStatus::Failed {
                kind: ErrorKind::Other,
                ..
            }
        ));
    }
}
