//! Seams to the real-time transport and the local media devices.

use std::sync::Arc;

use async_trait::async_trait;
use livecast_capture::MediaSource;
use livecast_ipc::{AccessCredential, Role, SessionId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ConnectionResult;

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Link state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

/// Why the transport dropped the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The local client left on purpose.
    Leave,

    /// The network went away.
    Network,

    /// The server closed the link.
    Server(String),
}

/// Events emitted by the transport client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    UserJoined { uid: u32 },
    UserLeft { uid: u32 },
    UserPublished { uid: u32, kind: MediaKind },
    UserUnpublished { uid: u32, kind: MediaKind },
    ConnectionStateChange {
        current: LinkState,
        reason: Option<DisconnectReason>,
    },
    TokenPrivilegeWillExpire,
    TokenPrivilegeDidExpire,
}

/// Real-time transport client. One client serves one manager and holds at
/// most one join at a time.
#[async_trait]
pub trait RtcClient: Send + Sync {
    /// Join the credential's channel as the credential's uid.
    async fn join(&self, credential: &AccessCredential) -> ConnectionResult<()>;

    /// Leave the current channel, dropping publications and subscriptions.
    async fn leave(&self) -> ConnectionResult<()>;

    /// Publish local tracks.
    async fn publish(&self, tracks: &dyn LocalTracks) -> ConnectionResult<()>;

    /// Subscribe to a remote user's track.
    async fn subscribe(&self, uid: u32, kind: MediaKind) -> ConnectionResult<Box<dyn RemoteTrack>>;

    /// Replace the credential of the current join.
    async fn renew_token(&self, token: &str) -> ConnectionResult<()>;

    /// Tracks already published by remote users in the joined channel.
    fn remote_publications(&self) -> Vec<(u32, MediaKind)>;

    /// Subscribe to transport events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Camera and microphone tracks owned by the connection manager.
pub trait LocalTracks: Send + Sync {
    /// Kinds of track available.
    fn kinds(&self) -> Vec<MediaKind>;

    fn audio_enabled(&self) -> bool;
    fn set_audio_enabled(&self, enabled: bool);

    fn video_enabled(&self) -> bool;
    fn set_video_enabled(&self, enabled: bool);

    /// A capture stream reading the same tracks. Stopping the capture
    /// stream leaves the tracks running.
    fn capture_source(&self) -> Box<dyn MediaSource>;

    /// Release the devices.
    fn stop(&self);
}

/// Access to local camera and microphone.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self) -> ConnectionResult<Arc<dyn LocalTracks>>;
}

/// A subscribed remote track.
pub trait RemoteTrack: Send + Sync {
    fn uid(&self) -> u32;
    fn kind(&self) -> MediaKind;

    /// Start local playback.
    fn play(&self);

    /// Stop local playback. The subscription stays active.
    fn stop(&self);

    fn is_playing(&self) -> bool;
}

/// Issues channel credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Every call yields a fresh, independently valid credential.
    async fn request_access_credential(
        &self,
        session_id: SessionId,
        role: Role,
    ) -> ConnectionResult<AccessCredential>;

    /// A fresh credential for a uid that is already joined. Renewal keeps
    /// the uid; only a rejoin may change it.
    async fn renew_access_credential(
        &self,
        session_id: SessionId,
        role: Role,
        uid: u32,
    ) -> ConnectionResult<AccessCredential>;
}
