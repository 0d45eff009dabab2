//! Audience page controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use livecast_ipc::{AudienceStatus, BroadcastEvent, LiveSession, LivecastConfig, Role, SessionId};
use livecast_transport::{
    ConnectionDeps, ConnectionManager, ConnectionOptions, ConnectionState, RtcClient,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::SessionCache;
use crate::error::EngineError;
use crate::lifecycle::LifecycleService;
use crate::presence::{AudiencePresence, PresenceLedger};
use crate::EngineResult;

/// Collaborators of an audience page.
pub struct ViewerDeps {
    pub lifecycle: LifecycleService,
    pub cache: Arc<SessionCache>,
    pub client: Arc<dyn RtcClient>,

    /// Heartbeat backstop for viewers whose leave never arrives.
    pub ledger: Option<Arc<PresenceLedger>>,

    pub config: LivecastConfig,
    pub events: Option<Sender<BroadcastEvent>>,
}

struct ViewerShared {
    status_tx: watch::Sender<AudienceStatus>,
    ended: AtomicBool,
    events: Option<Sender<BroadcastEvent>>,
}

impl ViewerShared {
    fn transition_to(&self, status: AudienceStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous == status {
            return;
        }

        debug!(?previous, current = ?status, "Audience status transition");
        self.send_event(BroadcastEvent::AudienceStatusChanged {
            previous,
            current: status,
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

/// Composite status shown to a viewer.
fn audience_status(session: Option<&LiveSession>, state: &ConnectionState, video: bool) -> AudienceStatus {
    if !session.is_some_and(LiveSession::is_live) {
        return AudienceStatus::Ended;
    }
    match state {
        ConnectionState::Connecting => AudienceStatus::Connecting,
        ConnectionState::Reconnecting { .. } => AudienceStatus::Reconnecting,
        ConnectionState::Connected if video => AudienceStatus::Watching,
        ConnectionState::Connected => AudienceStatus::WaitingForHost,
        ConnectionState::Disconnected | ConnectionState::Failed { .. } => {
            AudienceStatus::Disconnected
        }
    }
}

/// One viewer watching one session.
pub struct ViewerSession {
    session_id: SessionId,
    manager: Arc<ConnectionManager>,
    presence: Arc<AudiencePresence>,
    session_rx: watch::Receiver<Option<LiveSession>>,
    shared: Arc<ViewerShared>,
    heartbeat_period: Duration,
    heartbeat_started: AtomicBool,
    token: CancellationToken,
}

impl ViewerSession {
    /// Prepare to watch a session. Fails if the session does not exist.
    pub async fn open(session_id: SessionId, deps: ViewerDeps) -> EngineResult<Self> {
        let session_rx = deps.cache.watch_session(session_id).await?;
        let recorder_uid = match session_rx.borrow().as_ref() {
            Some(session) => session.recorder_uid,
            None => return Err(EngineError::SessionNotFound(session_id)),
        };

        let mut options = ConnectionOptions::from_config(session_id, Role::Audience, &deps.config);
        options.ignored_uids.extend(recorder_uid);
        let manager = Arc::new(ConnectionManager::new(
            options,
            ConnectionDeps {
                client: deps.client,
                credentials: Arc::new(deps.lifecycle.clone()),
                devices: None,
                viewer_count: None,
                events: None,
            },
        ));
        let presence = Arc::new(AudiencePresence::new(
            Arc::new(deps.lifecycle),
            deps.ledger,
            session_id,
        ));
        let shared = Arc::new(ViewerShared {
            status_tx: watch::channel(AudienceStatus::Disconnected).0,
            ended: AtomicBool::new(false),
            events: deps.events,
        });

        let token = CancellationToken::new();
        tokio::spawn(follow_session(
            Arc::clone(&shared),
            Arc::clone(&manager),
            Arc::clone(&presence),
            session_rx.clone(),
            token.clone(),
        ));

        Ok(Self {
            session_id,
            manager,
            presence,
            session_rx,
            shared,
            heartbeat_period: deps.config.presence.heartbeat_timeout() / 3,
            heartbeat_started: AtomicBool::new(false),
            token,
        })
    }

    /// Join as audience. The viewer is counted in once the connection is
    /// up, which may be later if the page is hidden. A session that already
    /// ended is shown as ended without connecting.
    #[instrument(name = "viewer_start", skip(self), fields(session_id = %self.session_id))]
    pub async fn start(&self) -> EngineResult<()> {
        let live = self
            .session_rx
            .borrow()
            .as_ref()
            .is_some_and(LiveSession::is_live);
        if !live || self.shared.ended.load(Ordering::SeqCst) {
            debug!("Session already ended, not connecting");
            self.shared.transition_to(AudienceStatus::Ended);
            return Ok(());
        }

        if let Err(e) = self.manager.start().await {
            warn!("Joining as viewer failed: {}", e);
            self.shared.send_event(BroadcastEvent::Error {
                kind: e.kind(),
                message: e.user_message(),
            });
            return Err(e.into());
        }

        if self.manager.state().is_connected() {
            enter_presence(&self.presence).await;
            info!("Watching");
        } else {
            debug!("Not connected yet, deferring viewer count");
        }
        self.spawn_heartbeat();
        Ok(())
    }

    fn spawn_heartbeat(&self) {
        if self.heartbeat_started.swap(true, Ordering::SeqCst) || self.heartbeat_period.is_zero() {
            return;
        }

        let presence = Arc::clone(&self.presence);
        let token = self.token.clone();
        let period = self.heartbeat_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = presence.heartbeat().await {
                            warn!("Presence heartbeat failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Hold or release the connection as the page is shown or hidden.
    pub async fn set_visible(&self, visible: bool) -> EngineResult<()> {
        if visible && self.shared.ended.load(Ordering::SeqCst) {
            return Ok(());
        }
        Ok(self.manager.set_enabled(visible).await?)
    }

    /// Returns true when remote audio is now muted.
    pub fn toggle_remote_audio(&self) -> EngineResult<bool> {
        Ok(self.manager.toggle_remote_audio()?)
    }

    /// Stop watching. Safe to call more than once.
    #[instrument(name = "viewer_leave", skip(self), fields(session_id = %self.session_id))]
    pub async fn leave(&self) {
        self.token.cancel();
        self.manager.leave().await;
        self.presence.leave().await;
        if !self.shared.ended.load(Ordering::SeqCst) {
            self.shared.transition_to(AudienceStatus::Disconnected);
        }
    }

    pub fn status(&self) -> AudienceStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<AudienceStatus> {
        self.shared.status_tx.subscribe()
    }

    /// True while this viewer is included in the session's viewer count.
    pub fn is_counted(&self) -> bool {
        self.presence.is_entered()
    }

    pub fn session(&self) -> Option<LiveSession> {
        self.session_rx.borrow().clone()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.manager
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn enter_presence(presence: &AudiencePresence) {
    if let Err(e) = presence.enter().await {
        warn!("Viewer count increment failed: {}", e);
    }
}

async fn follow_session(
    shared: Arc<ViewerShared>,
    manager: Arc<ConnectionManager>,
    presence: Arc<AudiencePresence>,
    mut session_rx: watch::Receiver<Option<LiveSession>>,
    token: CancellationToken,
) {
    let mut state_rx = manager.watch_state();
    let mut video_rx = manager.watch_remote_video();
    let mut video = *video_rx.borrow_and_update();

    loop {
        let session = session_rx.borrow_and_update().clone();
        let state = state_rx.borrow_and_update().clone();
        let present = *video_rx.borrow_and_update();
        if present != video {
            video = present;
            shared.send_event(BroadcastEvent::RemoteVideo { present });
        }

        let status = audience_status(session.as_ref(), &state, video);
        shared.transition_to(status);
        if status == AudienceStatus::Ended {
            if !shared.ended.swap(true, Ordering::SeqCst) {
                info!("Host ended the session");
                manager.leave().await;
                presence.leave().await;
            }
            break;
        }
        if state.is_connected() && !presence.is_entered() && !token.is_cancelled() {
            enter_presence(&presence).await;
        }

        tokio::select! {
            _ = token.cancelled() => break,
            changed = session_rx.changed() => if changed.is_err() { break },
            changed = state_rx.changed() => if changed.is_err() { break },
            changed = video_rx.changed() => if changed.is_err() { break },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use livecast_ipc::{Privacy, RecordingStatus, SessionStatus};
    use uuid::Uuid;

    fn session(status: SessionStatus) -> LiveSession {
        LiveSession {
            id: Uuid::new_v4(),
            host_user_id: "host".to_string(),
            channel: "live_host_1".to_string(),
            host_uid: 7,
            recorder_uid: None,
            title: "Q&A".to_string(),
            privacy: Privacy::Public,
            status,
            recording_status: RecordingStatus::Recording,
            viewer_count: 0,
            started_at: Utc::now(),
            ended_at: None,
            post_id: Uuid::new_v4(),
            playback_url: None,
        }
    }

    #[test]
    fn ended_session_wins_over_connection_state() {
        let ended = session(SessionStatus::Ended);
        assert_eq!(
            audience_status(Some(&ended), &ConnectionState::Connected, true),
            AudienceStatus::Ended
        );
        assert_eq!(
            audience_status(None, &ConnectionState::Connected, true),
            AudienceStatus::Ended
        );
    }

    #[test]
    fn live_session_status_follows_connection() {
        let live = session(SessionStatus::Live);
        let cases = [
            (ConnectionState::Disconnected, false, AudienceStatus::Disconnected),
            (ConnectionState::Connecting, false, AudienceStatus::Connecting),
            (ConnectionState::Connected, false, AudienceStatus::WaitingForHost),
            (ConnectionState::Connected, true, AudienceStatus::Watching),
            (
                ConnectionState::Reconnecting { attempt: 1 },
                true,
                AudienceStatus::Reconnecting,
            ),
            (
                ConnectionState::Failed {
                    reason: "gone".to_string(),
                },
                false,
                AudienceStatus::Disconnected,
            ),
        ];

        for (state, video, expected) in cases {
            assert_eq!(audience_status(Some(&live), &state, video), expected);
        }
    }
}
