//! Connection manager: one real-time session per logical broadcast.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use livecast_ipc::{LivecastConfig, Role, SessionId};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::client::{
    CredentialProvider, DisconnectReason, LinkState, LocalTracks, MediaDevices, MediaKind,
    RemoteTrack, RtcClient, TransportEvent,
};
use crate::connection::{ConnectionState, ReconnectPolicy};
use crate::error::ConnectionError;
use crate::machine::{Action, ConnectionMachine, Input};
use crate::{ConnectionResult, DEFAULT_JOIN_TIMEOUT_MS, MAX_RENEW_FAILURES};

/// Advisory viewer-count callback (host role). Callers must debounce it.
pub type ViewerCountCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Events reported by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },

    /// Remote video appeared or disappeared (audience role).
    RemoteVideo { present: bool },

    /// Reconnection gave up. Sent once per failure.
    ReconnectFailed { reason: String },
}

/// Per-manager settings.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub session_id: SessionId,
    pub role: Role,
    pub policy: ReconnectPolicy,
    pub max_renew_failures: u32,
    pub join_timeout: Duration,

    /// Whether the manager may hold a live connection.
    pub enabled: bool,

    /// Remote uids left out of the viewer count (e.g. a recorder).
    pub ignored_uids: Vec<u32>,
}

impl ConnectionOptions {
    pub fn new(session_id: SessionId, role: Role) -> Self {
        Self {
            session_id,
            role,
            policy: ReconnectPolicy::default(),
            max_renew_failures: MAX_RENEW_FAILURES,
            join_timeout: Duration::from_millis(DEFAULT_JOIN_TIMEOUT_MS),
            enabled: true,
            ignored_uids: Vec::new(),
        }
    }

    pub fn from_config(session_id: SessionId, role: Role, config: &LivecastConfig) -> Self {
        Self {
            policy: ReconnectPolicy::from(&config.reconnect),
            max_renew_failures: config.renewal.max_consecutive_failures,
            join_timeout: config.join_timeout(),
            ..Self::new(session_id, role)
        }
    }
}

/// Collaborators of a manager.
pub struct ConnectionDeps {
    pub client: Arc<dyn RtcClient>,
    pub credentials: Arc<dyn CredentialProvider>,

    /// Required for the host role.
    pub devices: Option<Arc<dyn MediaDevices>>,

    pub viewer_count: Option<ViewerCountCallback>,
    pub events: Option<Sender<ConnectionEvent>>,
}

#[derive(Default)]
struct RemoteState {
    users: HashSet<u32>,
    video_publishers: HashSet<u32>,
    tracks: Vec<Box<dyn RemoteTrack>>,
    audio_muted: bool,
}

struct Shared {
    options: ConnectionOptions,
    client: Arc<dyn RtcClient>,
    credentials: Arc<dyn CredentialProvider>,
    devices: Option<Arc<dyn MediaDevices>>,
    viewer_count: Option<ViewerCountCallback>,
    events: Option<Sender<ConnectionEvent>>,
    machine: Mutex<ConnectionMachine>,
    enabled: AtomicBool,
    start_in_flight: AtomicBool,
    joined: AtomicBool,
    joined_uid: Mutex<Option<u32>>,
    session_token: Mutex<CancellationToken>,
    local_tracks: Mutex<Option<Arc<dyn LocalTracks>>>,
    remote: Mutex<RemoteState>,
    state_tx: watch::Sender<ConnectionState>,
    remote_video_tx: watch::Sender<bool>,
}

/// Owns one real-time session: join, publish or subscribe, leave, and
/// keeping the session alive across transient failures.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ConnectionManager {
    pub fn new(options: ConnectionOptions, deps: ConnectionDeps) -> Self {
        let machine = ConnectionMachine::new(options.policy.clone(), options.max_renew_failures);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (remote_video_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                enabled: AtomicBool::new(options.enabled),
                options,
                client: deps.client,
                credentials: deps.credentials,
                devices: deps.devices,
                viewer_count: deps.viewer_count,
                events: deps.events,
                machine: Mutex::new(machine),
                start_in_flight: AtomicBool::new(false),
                joined: AtomicBool::new(false),
                joined_uid: Mutex::new(None),
                session_token: Mutex::new(CancellationToken::new()),
                local_tracks: Mutex::new(None),
                remote: Mutex::new(RemoteState::default()),
                state_tx,
                remote_video_tx,
            }),
        }
    }

    /// Acquire a credential and join; publish (host) or subscribe
    /// (audience). A no-op when disabled, already connected, or another
    /// start is in flight.
    #[instrument(
        name = "connection_start",
        skip(self),
        fields(session_id = %self.shared.options.session_id, role = ?self.shared.options.role)
    )]
    pub async fn start(&self) -> ConnectionResult<()> {
        let shared = &self.shared;
        if !shared.enabled.load(Ordering::SeqCst) {
            debug!("Manager disabled, not connecting");
            return Ok(());
        }
        if shared.start_in_flight.swap(true, Ordering::SeqCst) {
            debug!("Start already in flight, ignoring");
            return Ok(());
        }
        let _guard = InFlightGuard(&shared.start_in_flight);

        let actions = shared.apply(Input::Start);
        if !actions.iter().any(|a| matches!(a, Action::Join { .. })) {
            debug!("Already connected, ignoring start");
            return Ok(());
        }

        let token = CancellationToken::new();
        let previous = std::mem::replace(&mut *shared.session_token.lock(), token.clone());
        previous.cancel();

        tokio::spawn(run_events(
            Arc::clone(shared),
            shared.client.events(),
            token.clone(),
        ));

        let result = tokio::select! {
            _ = token.cancelled() => Err(ConnectionError::Cancelled),
            result = tokio::time::timeout(shared.options.join_timeout, shared.connect_once(0)) => {
                result.unwrap_or(Err(ConnectionError::Timeout))
            }
        };

        match result {
            Ok(()) => {
                for action in shared.apply(Input::Joined) {
                    shared.perform_one(action).await;
                }
                Ok(())
            }
            Err(e) => {
                warn!("Start failed: {}", e);
                shared.apply(Input::JoinFailed {
                    retryable: e.is_retryable(),
                    reason: e.to_string(),
                });
                token.cancel();
                shared.drop_link().await;
                shared.release_tracks();
                Err(e)
            }
        }
    }

    /// Tear down tracks, subscriptions, the join and every timer.
    /// Safe to call repeatedly and while `start()` is in flight.
    #[instrument(
        name = "connection_leave",
        skip(self),
        fields(session_id = %self.shared.options.session_id)
    )]
    pub async fn leave(&self) {
        let shared = &self.shared;
        shared.apply(Input::Leave);
        shared.session_token.lock().cancel();
        shared.drop_link().await;
        shared.release_tracks();
        info!("Left channel");
    }

    /// Allow or forbid a live connection. Disabling leaves; enabling
    /// starts.
    pub async fn set_enabled(&self, enabled: bool) -> ConnectionResult<()> {
        let was_enabled = self.shared.enabled.swap(enabled, Ordering::SeqCst);
        if was_enabled == enabled {
            return Ok(());
        }

        debug!(enabled, "Connection gate changed");
        if enabled {
            self.start().await
        } else {
            self.leave().await;
            Ok(())
        }
    }

    /// Flip microphone enablement. Returns true when now muted.
    pub fn toggle_mute(&self) -> ConnectionResult<bool> {
        let tracks = self.host_tracks()?;
        let enabled = !tracks.audio_enabled();
        tracks.set_audio_enabled(enabled);
        info!(muted = !enabled, "Microphone toggled");
        Ok(!enabled)
    }

    /// Flip camera enablement. Returns true when the camera is now off.
    pub fn toggle_camera(&self) -> ConnectionResult<bool> {
        let tracks = self.host_tracks()?;
        let enabled = !tracks.video_enabled();
        tracks.set_video_enabled(enabled);
        info!(camera_off = !enabled, "Camera toggled");
        Ok(!enabled)
    }

    /// Stop or restart local playback of remote audio. Subscriptions are
    /// untouched. Returns true when now muted.
    pub fn toggle_remote_audio(&self) -> ConnectionResult<bool> {
        if self.shared.options.role != Role::Audience {
            return Err(ConnectionError::WrongRole(Role::Audience));
        }

        let mut remote = self.shared.remote.lock();
        remote.audio_muted = !remote.audio_muted;
        let muted = remote.audio_muted;
        for track in remote.tracks.iter().filter(|t| t.kind() == MediaKind::Audio) {
            if muted {
                track.stop();
            } else {
                track.play();
            }
        }
        info!(muted, "Remote audio toggled");
        Ok(muted)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// True once the host's video is subscribed (audience role).
    pub fn remote_video_present(&self) -> bool {
        *self.shared.remote_video_tx.borrow()
    }

    pub fn watch_remote_video(&self) -> watch::Receiver<bool> {
        self.shared.remote_video_tx.subscribe()
    }

    /// Local tracks while joined as host. Borrowers must not stop them.
    pub fn local_tracks(&self) -> Option<Arc<dyn LocalTracks>> {
        self.shared.local_tracks.lock().clone()
    }

    /// Remote users currently in the channel, minus ignored uids.
    pub fn remote_user_count(&self) -> u32 {
        self.shared.counted_users()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.shared.options
    }

    fn host_tracks(&self) -> ConnectionResult<Arc<dyn LocalTracks>> {
        if self.shared.options.role != Role::Host {
            return Err(ConnectionError::WrongRole(Role::Host));
        }
        self.local_tracks().ok_or(ConnectionError::NotJoined)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.session_token.lock().cancel();
        self.shared.release_tracks();
        if self.shared.joined.load(Ordering::SeqCst) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let shared = Arc::clone(&self.shared);
                handle.spawn(async move { shared.drop_link().await });
            }
        }
    }
}

impl Shared {
    fn apply(&self, input: Input) -> Vec<Action> {
        let (actions, state) = {
            let mut machine = self.machine.lock();
            let actions = machine.handle(input);
            (actions, machine.state().clone())
        };
        self.publish_state(state);
        actions
    }

    fn publish_state(&self, current: ConnectionState) {
        let mut previous = None;
        self.state_tx.send_if_modified(|state| {
            if *state == current {
                return false;
            }
            previous = Some(std::mem::replace(state, current.clone()));
            true
        });

        if let Some(previous) = previous {
            info!(
                previous = %previous.name(),
                current = %current.name(),
                "Connection state changed"
            );
            self.send_event(ConnectionEvent::StateChanged { previous, current });
        }
    }

    fn send_event(&self, event: ConnectionEvent) {
        if let Some(tx) = &self.events {
            if let Err(e) = tx.try_send(event) {
                warn!("Failed to send connection event: {}", e);
            }
        }
    }

    async fn connect_once(&self, attempt: u32) -> ConnectionResult<()> {
        let role = self.options.role;
        let credential = self
            .credentials
            .request_access_credential(self.options.session_id, role)
            .await?;

        debug!(attempt, uid = credential.uid, channel = %credential.channel, "Joining channel");
        self.client.join(&credential).await?;
        self.joined.store(true, Ordering::SeqCst);
        *self.joined_uid.lock() = Some(credential.uid);

        match role {
            Role::Host => {
                let tracks = self.ensure_local_tracks().await?;
                self.client.publish(tracks.as_ref()).await?;
            }
            Role::Audience => {
                for (uid, kind) in self.client.remote_publications() {
                    self.remote.lock().users.insert(uid);
                    if let Err(e) = self.subscribe_remote(uid, kind).await {
                        warn!(uid, ?kind, "Subscribe failed: {}", e);
                    }
                }
            }
        }

        info!(attempt, channel = %credential.channel, ?role, "Joined channel");
        Ok(())
    }

    async fn ensure_local_tracks(&self) -> ConnectionResult<Arc<dyn LocalTracks>> {
        if let Some(tracks) = self.local_tracks.lock().clone() {
            return Ok(tracks);
        }

        let devices = self
            .devices
            .as_ref()
            .ok_or_else(|| ConnectionError::DeviceNotFound("no media devices".to_string()))?;
        let tracks = devices.acquire().await?;
        *self.local_tracks.lock() = Some(Arc::clone(&tracks));
        debug!(kinds = ?tracks.kinds(), "Local tracks acquired");
        Ok(tracks)
    }

    async fn subscribe_remote(&self, uid: u32, kind: MediaKind) -> ConnectionResult<()> {
        let track = self.client.subscribe(uid, kind).await?;
        {
            let mut remote = self.remote.lock();
            let muted = remote.audio_muted;
            if kind == MediaKind::Video {
                remote.video_publishers.insert(uid);
            }
            if kind == MediaKind::Video || !muted {
                track.play();
            }
            remote.tracks.push(track);
        }
        debug!(uid, ?kind, "Subscribed to remote track");
        self.update_remote_video();
        Ok(())
    }

    fn remove_remote_tracks(&self, uid: u32, kind: Option<MediaKind>) {
        {
            let mut remote = self.remote.lock();
            remote.tracks.retain(|track| {
                let matches = track.uid() == uid && kind.map_or(true, |k| track.kind() == k);
                if matches {
                    track.stop();
                }
                !matches
            });
            if kind.map_or(true, |k| k == MediaKind::Video) {
                remote.video_publishers.remove(&uid);
            }
        }
        self.update_remote_video();
    }

    fn update_remote_video(&self) {
        let present = !self.remote.lock().video_publishers.is_empty();
        if self.remote_video_tx.send_if_modified(|current| {
            let changed = *current != present;
            *current = present;
            changed
        }) {
            debug!(present, "Remote video changed");
            self.send_event(ConnectionEvent::RemoteVideo { present });
        }
    }

    fn counted_users(&self) -> u32 {
        let remote = self.remote.lock();
        remote
            .users
            .iter()
            .filter(|uid| !self.options.ignored_uids.contains(uid))
            .count() as u32
    }

    fn notify_viewers(&self) {
        if self.options.role != Role::Host {
            return;
        }
        if let Some(callback) = &self.viewer_count {
            callback(self.counted_users());
        }
    }

    /// Leave the channel but keep local tracks for a rejoin.
    async fn drop_link(&self) {
        self.joined_uid.lock().take();
        if self.joined.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.client.leave().await {
                warn!("Channel leave failed: {}", e);
            }
        }

        {
            let mut remote = self.remote.lock();
            for track in remote.tracks.drain(..) {
                track.stop();
            }
            remote.video_publishers.clear();
            remote.users.clear();
        }
        self.update_remote_video();
    }

    fn release_tracks(&self) {
        if let Some(tracks) = self.local_tracks.lock().take() {
            tracks.stop();
            debug!("Local tracks released");
        }
    }

    async fn renew(&self) -> ConnectionResult<()> {
        let uid = (*self.joined_uid.lock()).ok_or(ConnectionError::NotJoined)?;
        let credential = self
            .credentials
            .renew_access_credential(self.options.session_id, self.options.role, uid)
            .await?;
        self.client.renew_token(&credential.token).await
    }

    fn report_failed(&self, reason: String) {
        error!(%reason, "Reconnection failed");
        self.send_event(ConnectionEvent::ReconnectFailed { reason });
    }

    async fn perform(self: &Arc<Self>, actions: Vec<Action>, token: &CancellationToken) {
        for action in actions {
            match action {
                Action::ScheduleRetry { attempt, delay } => {
                    tokio::spawn(reconnect_loop(
                        Arc::clone(self),
                        token.clone(),
                        attempt,
                        delay,
                    ));
                }
                other => self.perform_one(other).await,
            }
        }
    }

    async fn perform_one(&self, action: Action) {
        match action {
            Action::Teardown => self.drop_link().await,
            Action::Disconnect => {
                self.drop_link().await;
                self.release_tracks();
            }
            Action::ReportFailed { reason } => self.report_failed(reason),
            other => debug!(?other, "Action handled by caller"),
        }
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent, token: &CancellationToken) {
        trace!(?event, "Transport event");

        match event {
            TransportEvent::UserJoined { uid } => {
                self.remote.lock().users.insert(uid);
                self.notify_viewers();
            }
            TransportEvent::UserLeft { uid } => {
                self.remote.lock().users.remove(&uid);
                self.remove_remote_tracks(uid, None);
                self.notify_viewers();
            }
            TransportEvent::UserPublished { uid, kind } => {
                if self.options.role == Role::Audience && self.joined.load(Ordering::SeqCst) {
                    if let Err(e) = self.subscribe_remote(uid, kind).await {
                        warn!(uid, ?kind, "Subscribe failed: {}", e);
                    }
                }
            }
            TransportEvent::UserUnpublished { uid, kind } => {
                if self.options.role == Role::Audience {
                    self.remove_remote_tracks(uid, Some(kind));
                }
            }
            TransportEvent::ConnectionStateChange {
                current: LinkState::Disconnected,
                reason,
            } => {
                if reason == Some(DisconnectReason::Leave) {
                    return;
                }
                warn!(?reason, "Connection lost");
                self.joined.store(false, Ordering::SeqCst);
                let actions = self.apply(Input::ConnectionLost {
                    reason: format!("{:?}", reason),
                });
                self.perform(actions, token).await;
            }
            TransportEvent::ConnectionStateChange { current, .. } => {
                debug!(?current, "Transport link state");
            }
            TransportEvent::TokenPrivilegeWillExpire => {
                let actions = self.apply(Input::TokenWillExpire);
                if !actions.contains(&Action::RenewToken) {
                    return;
                }

                let input = match self.renew().await {
                    Ok(()) => {
                        info!("Token renewed");
                        Input::RenewSucceeded
                    }
                    Err(e) => {
                        warn!("Token renewal failed: {}", e);
                        Input::RenewFailed {
                            reason: e.to_string(),
                        }
                    }
                };
                let follow_up = self.apply(input);
                self.perform(follow_up, token).await;
            }
            TransportEvent::TokenPrivilegeDidExpire => {
                warn!("Token expired before renewal");
                let actions = self.apply(Input::TokenExpired);
                self.perform(actions, token).await;
            }
        }
    }
}

async fn run_events(
    shared: Arc<Shared>,
    mut events: broadcast::Receiver<TransportEvent>,
    token: CancellationToken,
) {
    debug!("Transport event loop starting");

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(event) => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = shared.handle_event(event, &token) => {}
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Transport events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    debug!("Transport event loop stopped");
}

async fn reconnect_loop(
    shared: Arc<Shared>,
    token: CancellationToken,
    attempt: u32,
    delay: Duration,
) {
    let mut next = Some((attempt, delay));

    while let Some((attempt, delay)) = next.take() {
        info!(attempt, ?delay, "Rejoin scheduled");
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let actions = shared.apply(Input::RetryDue);
        if !actions.iter().any(|a| matches!(a, Action::Join { .. })) {
            return;
        }

        let result = tokio::select! {
            _ = token.cancelled() => {
                shared.drop_link().await;
                return;
            }
            result = tokio::time::timeout(shared.options.join_timeout, shared.connect_once(attempt)) => {
                result.unwrap_or(Err(ConnectionError::Timeout))
            }
        };

        let input = match result {
            Ok(()) => Input::Joined,
            Err(e) => {
                warn!(attempt, "Rejoin failed: {}", e);
                Input::JoinFailed {
                    retryable: e.is_retryable(),
                    reason: e.to_string(),
                }
            }
        };

        for action in shared.apply(input) {
            match action {
                Action::ScheduleRetry { attempt, delay } => next = Some((attempt, delay)),
                other => shared.perform_one(other).await,
            }
        }
    }
}
