//! In-process transport used by tests and the demo binary.
//!
//! A [`LoopbackHub`] plays the role of the media server: clients joined
//! to the same channel see each other's joins and publications. Faults
//! (failed joins, failed renewals, dropped links, token signals) can be
//! injected to exercise the reconnection paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use livecast_capture::{MediaSource, SyntheticSource};
use livecast_ipc::{AccessCredential, Role, SessionId};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::client::{
    CredentialProvider, DisconnectReason, LinkState, LocalTracks, MediaDevices, MediaKind,
    RemoteTrack, RtcClient, TransportEvent,
};
use crate::error::ConnectionError;
use crate::{ConnectionResult, TRANSPORT_EVENT_CAPACITY};

struct Member {
    client_id: u64,
    uid: u32,
    publications: Vec<MediaKind>,
    events: broadcast::Sender<TransportEvent>,
}

#[derive(Default)]
struct HubInner {
    channels: HashMap<String, Vec<Member>>,
    failing_joins: u32,
    failing_renewals: u32,
    next_client_id: u64,
}

/// Shared in-process media server.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client attached to this hub.
    pub fn client(&self) -> LoopbackClient {
        let id = {
            let mut inner = self.inner.lock();
            inner.next_client_id += 1;
            inner.next_client_id
        };
        let (events, _) = broadcast::channel(TRANSPORT_EVENT_CAPACITY);

        LoopbackClient {
            id,
            hub: self.clone(),
            events,
            joined: Mutex::new(None),
            join_count: AtomicU32::new(0),
            renew_count: AtomicU32::new(0),
        }
    }

    /// Make the next `count` joins fail with a network error.
    pub fn fail_next_joins(&self, count: u32) {
        self.inner.lock().failing_joins = count;
    }

    /// Make the next `count` renewals fail with a network error.
    pub fn fail_next_renewals(&self, count: u32) {
        self.inner.lock().failing_renewals = count;
    }

    pub fn member_count(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .channels
            .get(channel)
            .map_or(0, |members| members.len())
    }

    pub fn members(&self, channel: &str) -> Vec<u32> {
        self.inner
            .lock()
            .channels
            .get(channel)
            .map(|members| members.iter().map(|m| m.uid).collect())
            .unwrap_or_default()
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }

    fn remove_member(&self, channel: &str, client_id: u64) {
        let mut inner = self.inner.lock();
        let Some(members) = inner.channels.get_mut(channel) else {
            return;
        };
        let Some(index) = members.iter().position(|m| m.client_id == client_id) else {
            return;
        };

        let member = members.remove(index);
        for other in members.iter() {
            let _ = other.events.send(TransportEvent::UserLeft { uid: member.uid });
        }
        if members.is_empty() {
            inner.channels.remove(channel);
        }
    }
}

struct Joined {
    channel: String,
    uid: u32,
    token: String,
}

/// A transport client connected to a [`LoopbackHub`].
pub struct LoopbackClient {
    id: u64,
    hub: LoopbackHub,
    events: broadcast::Sender<TransportEvent>,
    joined: Mutex<Option<Joined>>,
    join_count: AtomicU32,
    renew_count: AtomicU32,
}

impl LoopbackClient {
    /// Successful joins so far.
    pub fn join_count(&self) -> u32 {
        self.join_count.load(Ordering::SeqCst)
    }

    /// Successful renewals so far.
    pub fn renew_count(&self) -> u32 {
        self.renew_count.load(Ordering::SeqCst)
    }

    pub fn is_joined(&self) -> bool {
        self.joined.lock().is_some()
    }

    /// Token of the current join.
    pub fn token(&self) -> Option<String> {
        self.joined.lock().as_ref().map(|j| j.token.clone())
    }

    /// Simulate the server dropping the link.
    pub fn drop_connection(&self) {
        if let Some(joined) = self.joined.lock().take() {
            debug!(uid = joined.uid, channel = %joined.channel, "Loopback link dropped");
            self.hub.remove_member(&joined.channel, self.id);
            let _ = self.events.send(TransportEvent::ConnectionStateChange {
                current: LinkState::Disconnected,
                reason: Some(DisconnectReason::Network),
            });
        }
    }

    pub fn signal_token_will_expire(&self) {
        let _ = self.events.send(TransportEvent::TokenPrivilegeWillExpire);
    }

    pub fn signal_token_expired(&self) {
        let _ = self.events.send(TransportEvent::TokenPrivilegeDidExpire);
    }

    fn current(&self) -> ConnectionResult<(String, u32)> {
        self.joined
            .lock()
            .as_ref()
            .map(|j| (j.channel.clone(), j.uid))
            .ok_or(ConnectionError::NotJoined)
    }
}

#[async_trait]
impl RtcClient for LoopbackClient {
    async fn join(&self, credential: &AccessCredential) -> ConnectionResult<()> {
        if self.is_joined() {
            return Err(ConnectionError::AlreadyJoined);
        }
        if credential.expires_at <= Utc::now() {
            return Err(ConnectionError::TokenExpired);
        }

        let _ = self.events.send(TransportEvent::ConnectionStateChange {
            current: LinkState::Connecting,
            reason: None,
        });

        {
            let mut inner = self.hub.inner.lock();
            if LoopbackHub::take_fault(&mut inner.failing_joins) {
                return Err(ConnectionError::Network("injected join failure".to_string()));
            }

            let members = inner.channels.entry(credential.channel.clone()).or_default();
            for other in members.iter() {
                let _ = other.events.send(TransportEvent::UserJoined {
                    uid: credential.uid,
                });
                let _ = self.events.send(TransportEvent::UserJoined { uid: other.uid });
            }
            members.push(Member {
                client_id: self.id,
                uid: credential.uid,
                publications: Vec::new(),
                events: self.events.clone(),
            });
        }

        *self.joined.lock() = Some(Joined {
            channel: credential.channel.clone(),
            uid: credential.uid,
            token: credential.token.clone(),
        });
        self.join_count.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::ConnectionStateChange {
            current: LinkState::Connected,
            reason: None,
        });
        Ok(())
    }

    async fn leave(&self) -> ConnectionResult<()> {
        let joined = self.joined.lock().take();
        if let Some(joined) = joined {
            self.hub.remove_member(&joined.channel, self.id);
            let _ = self.events.send(TransportEvent::ConnectionStateChange {
                current: LinkState::Disconnected,
                reason: Some(DisconnectReason::Leave),
            });
        }
        Ok(())
    }

    async fn publish(&self, tracks: &dyn LocalTracks) -> ConnectionResult<()> {
        let (channel, uid) = self.current()?;
        let kinds = tracks.kinds();

        let mut inner = self.hub.inner.lock();
        let members = inner
            .channels
            .get_mut(&channel)
            .ok_or(ConnectionError::NotJoined)?;
        for member in members.iter_mut() {
            if member.client_id == self.id {
                member.publications = kinds.clone();
            } else {
                for kind in &kinds {
                    let _ = member
                        .events
                        .send(TransportEvent::UserPublished { uid, kind: *kind });
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, uid: u32, kind: MediaKind) -> ConnectionResult<Box<dyn RemoteTrack>> {
        let (channel, _) = self.current()?;
        let publishing = self
            .hub
            .inner
            .lock()
            .channels
            .get(&channel)
            .is_some_and(|members| {
                members
                    .iter()
                    .any(|m| m.uid == uid && m.publications.contains(&kind))
            });

        if !publishing {
            return Err(ConnectionError::Transport(format!(
                "uid {} is not publishing {:?}",
                uid, kind
            )));
        }
        Ok(Box::new(LoopbackTrack::new(uid, kind)))
    }

    async fn renew_token(&self, token: &str) -> ConnectionResult<()> {
        if LoopbackHub::take_fault(&mut self.hub.inner.lock().failing_renewals) {
            return Err(ConnectionError::Network(
                "injected renewal failure".to_string(),
            ));
        }

        let mut joined = self.joined.lock();
        let joined = joined.as_mut().ok_or(ConnectionError::NotJoined)?;
        joined.token = token.to_string();
        self.renew_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remote_publications(&self) -> Vec<(u32, MediaKind)> {
        let Ok((channel, _)) = self.current() else {
            return Vec::new();
        };

        self.hub
            .inner
            .lock()
            .channels
            .get(&channel)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| m.client_id != self.id)
                    .flat_map(|m| m.publications.iter().map(move |k| (m.uid, *k)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// A remote track subscribed through the loopback hub.
pub struct LoopbackTrack {
    uid: u32,
    kind: MediaKind,
    playing: AtomicBool,
}

impl LoopbackTrack {
    pub fn new(uid: u32, kind: MediaKind) -> Self {
        Self {
            uid,
            kind,
            playing: AtomicBool::new(false),
        }
    }
}

impl RemoteTrack for LoopbackTrack {
    fn uid(&self) -> u32 {
        self.uid
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn play(&self) {
        self.playing.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.playing.store(false, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

/// Camera and microphone backed by a [`SyntheticSource`].
pub struct SyntheticTracks {
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    stopped: AtomicBool,
    segment_bytes: usize,
    segment_interval: Duration,
}

impl SyntheticTracks {
    pub fn new(segment_bytes: usize, segment_interval: Duration) -> Self {
        Self {
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            segment_bytes,
            segment_interval,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalTracks for SyntheticTracks {
    fn kinds(&self) -> Vec<MediaKind> {
        vec![MediaKind::Audio, MediaKind::Video]
    }

    fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    fn capture_source(&self) -> Box<dyn MediaSource> {
        Box::new(SyntheticSource::new(
            self.segment_bytes,
            self.segment_interval,
        ))
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Media devices that hand out [`SyntheticTracks`].
pub struct SyntheticDevices {
    deny_permission: AtomicBool,
    acquired: AtomicU32,
    last: Mutex<Option<Arc<SyntheticTracks>>>,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self {
            deny_permission: AtomicBool::new(false),
            acquired: AtomicU32::new(0),
            last: Mutex::new(None),
        }
    }

    /// Refuse every subsequent acquisition with a permission error.
    pub fn deny_permission(&self, deny: bool) {
        self.deny_permission.store(deny, Ordering::SeqCst);
    }

    pub fn acquire_count(&self) -> u32 {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Tracks handed out by the latest acquisition.
    pub fn last_tracks(&self) -> Option<Arc<SyntheticTracks>> {
        self.last.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(&self) -> ConnectionResult<Arc<dyn LocalTracks>> {
        if self.deny_permission.load(Ordering::SeqCst) {
            return Err(ConnectionError::PermissionDenied);
        }

        let tracks = Arc::new(SyntheticTracks::new(4096, Duration::from_millis(100)));
        self.acquired.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some(Arc::clone(&tracks));
        Ok(tracks)
    }
}

/// Credential provider that issues unsigned tokens for one channel.
pub struct LoopbackCredentials {
    channel: String,
    host_uid: u32,
    issued: AtomicU64,
    issued_uids: Mutex<Vec<u32>>,
    failing: AtomicU32,
}

impl LoopbackCredentials {
    pub fn new(channel: impl Into<String>, host_uid: u32) -> Self {
        Self {
            channel: channel.into(),
            host_uid,
            issued: AtomicU64::new(0),
            issued_uids: Mutex::new(Vec::new()),
            failing: AtomicU32::new(0),
        }
    }

    /// Make the next `count` requests fail.
    pub fn fail_next(&self, count: u32) {
        self.failing.store(count, Ordering::SeqCst);
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    /// Uid of every credential issued, in order.
    pub fn issued_uids(&self) -> Vec<u32> {
        self.issued_uids.lock().clone()
    }

    fn issue(
        &self,
        session_id: SessionId,
        role: Role,
        uid: Option<u32>,
    ) -> ConnectionResult<AccessCredential> {
        let failing = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ConnectionError::Credential(
                "credential service unavailable".to_string(),
            ));
        }

        let serial = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let uid = match (role, uid) {
            (Role::Host, _) => self.host_uid,
            (Role::Audience, Some(uid)) => uid,
            (Role::Audience, None) => 10_000 + serial as u32,
        };
        self.issued_uids.lock().push(uid);

        Ok(AccessCredential {
            app_id: "loopback".to_string(),
            token: format!("{}-{}", session_id, serial),
            uid,
            channel: self.channel.clone(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        })
    }
}

#[async_trait]
impl CredentialProvider for LoopbackCredentials {
    async fn request_access_credential(
        &self,
        session_id: SessionId,
        role: Role,
    ) -> ConnectionResult<AccessCredential> {
        self.issue(session_id, role, None)
    }

    async fn renew_access_credential(
        &self,
        session_id: SessionId,
        role: Role,
        uid: u32,
    ) -> ConnectionResult<AccessCredential> {
        self.issue(session_id, role, Some(uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(channel: &str, uid: u32) -> AccessCredential {
        AccessCredential {
            app_id: "loopback".into(),
            token: "t".into(),
            uid,
            channel: channel.into(),
            expires_at: Utc::now() + ChronoDuration::minutes(5),
        }
    }

    #[tokio::test]
    async fn second_join_is_rejected() {
        let hub = LoopbackHub::new();
        let client = hub.client();
        client.join(&credential("c", 1)).await.unwrap();

        assert!(matches!(
            client.join(&credential("c", 1)).await,
            Err(ConnectionError::AlreadyJoined)
        ));
        assert_eq!(hub.member_count("c"), 1);
    }

    #[tokio::test]
    async fn publications_are_visible_to_later_joiners() {
        let hub = LoopbackHub::new();
        let host = hub.client();
        host.join(&credential("c", 1)).await.unwrap();
        host.publish(&SyntheticTracks::new(8, Duration::from_millis(10)))
            .await
            .unwrap();

        let viewer = hub.client();
        let mut events = viewer.events();
        viewer.join(&credential("c", 2)).await.unwrap();

        let mut publications = viewer.remote_publications();
        publications.sort_by_key(|(_, kind)| *kind == MediaKind::Video);
        assert_eq!(publications, vec![(1, MediaKind::Audio), (1, MediaKind::Video)]);
        assert!(viewer.subscribe(1, MediaKind::Video).await.is_ok());
        assert!(viewer.subscribe(3, MediaKind::Video).await.is_err());

        let mut saw_host = false;
        while let Ok(event) = events.try_recv() {
            saw_host |= event == TransportEvent::UserJoined { uid: 1 };
        }
        assert!(saw_host);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let hub = LoopbackHub::new();
        let client = hub.client();
        hub.fail_next_joins(1);

        assert!(client.join(&credential("c", 1)).await.is_err());
        client.join(&credential("c", 1)).await.unwrap();

        hub.fail_next_renewals(1);
        assert!(client.renew_token("a").await.is_err());
        client.renew_token("b").await.unwrap();
        assert_eq!(client.token().as_deref(), Some("b"));
        assert_eq!(client.renew_count(), 1);
    }

    #[tokio::test]
    async fn expired_credential_is_refused() {
        let hub = LoopbackHub::new();
        let client = hub.client();
        let mut expired = credential("c", 1);
        expired.expires_at = Utc::now() - ChronoDuration::seconds(1);

        assert!(matches!(
            client.join(&expired).await,
            Err(ConnectionError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn dropped_link_notifies_peers() {
        let hub = LoopbackHub::new();
        let host = hub.client();
        let viewer = hub.client();
        host.join(&credential("c", 1)).await.unwrap();
        viewer.join(&credential("c", 2)).await.unwrap();
        let mut host_events = host.events();

        viewer.drop_connection();

        assert_eq!(hub.members("c"), vec![1]);
        assert_eq!(
            host_events.try_recv().unwrap(),
            TransportEvent::UserLeft { uid: 2 }
        );
        assert!(!viewer.is_joined());
    }
}
