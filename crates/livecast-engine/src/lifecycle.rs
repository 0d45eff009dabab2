//! Live session lifecycle service.
//!
//! Every session is created together with its feed post, and every
//! change to the session that the feed shows (status, viewer count,
//! replay URL) is mirrored into the post's metadata by merge patch so
//! fields written by other collaborators survive.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use livecast_ipc::{
    AccessCredential, Actor, LiveMetadata, LiveSession, Post, PostId, Privacy, RecordingStatus,
    Role, SessionId, SessionStatus, StoreSettings,
};
use livecast_store::{merge_json, update_with, Change, StoreError, Table};
use livecast_transport::{ConnectionResult, CredentialProvider};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::error::EngineError;
use crate::ids::{audience_uid, channel_id, host_uid, recorder_uid};
use crate::tokens::TokenIssuer;
use crate::EngineResult;

/// Steps of a session create, undone in reverse on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreatePhase {
    InsertPost,
    InsertSession,
    BackfillMetadata,
}

impl CreatePhase {
    fn next(self) -> Option<Self> {
        match self {
            Self::InsertPost => Some(Self::InsertSession),
            Self::InsertSession => Some(Self::BackfillMetadata),
            Self::BackfillMetadata => None,
        }
    }

    fn previous(self) -> Option<Self> {
        match self {
            Self::InsertPost => None,
            Self::InsertSession => Some(Self::InsertPost),
            Self::BackfillMetadata => Some(Self::InsertSession),
        }
    }
}

/// How a broadcast ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeRequest {
    pub recording_status: RecordingStatus,
    pub playback_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl FinalizeRequest {
    /// No replay was produced.
    pub fn failed() -> Self {
        Self {
            recording_status: RecordingStatus::Failed,
            playback_url: None,
            thumbnail_url: None,
        }
    }

    /// A replay was uploaded.
    pub fn ready(playback_url: impl Into<String>) -> Self {
        Self {
            recording_status: RecordingStatus::Ready,
            playback_url: Some(playback_url.into()),
            thumbnail_url: None,
        }
    }
}

/// CRUD over live sessions with the cross-entity invariants between a
/// session and its post.
#[derive(Clone)]
pub struct LifecycleService {
    actor: Option<Actor>,
    sessions: Arc<dyn Table<LiveSession>>,
    posts: Arc<dyn Table<Post>>,
    tokens: Arc<dyn TokenIssuer>,
    max_retries: u32,
}

impl LifecycleService {
    pub fn new(
        sessions: Arc<dyn Table<LiveSession>>,
        posts: Arc<dyn Table<Post>>,
        tokens: Arc<dyn TokenIssuer>,
        settings: &StoreSettings,
    ) -> Self {
        Self {
            actor: None,
            sessions,
            posts,
            tokens,
            max_retries: settings.merge_max_retries,
        }
    }

    /// A copy of this service acting on behalf of `actor`.
    pub fn with_actor(&self, actor: Actor) -> Self {
        Self {
            actor: Some(actor),
            ..self.clone()
        }
    }

    pub fn actor(&self) -> EngineResult<&Actor> {
        self.actor.as_ref().ok_or(EngineError::NotAuthenticated)
    }

    /// Create a live session and its paired post. Either both exist
    /// afterwards or neither does.
    #[instrument(
        name = "session_create",
        skip(self),
        fields(actor = ?self.actor.as_ref().map(|a| a.user_id.as_str()))
    )]
    pub async fn create(&self, title: &str, privacy: Privacy) -> EngineResult<LiveSession> {
        let actor = self.actor()?;
        let title = title.trim();
        if title.is_empty() {
            return Err(EngineError::InvalidInput("title is empty".to_string()));
        }

        let started_at = Utc::now();
        let channel = channel_id(actor, started_at);
        let host = host_uid(&actor.user_id);
        let session = LiveSession {
            id: Uuid::new_v4(),
            host_user_id: actor.user_id.clone(),
            channel: channel.clone(),
            host_uid: host,
            recorder_uid: Some(recorder_uid(host)),
            title: title.to_string(),
            privacy,
            status: SessionStatus::Live,
            recording_status: RecordingStatus::Idle,
            viewer_count: 0,
            started_at,
            ended_at: None,
            post_id: Uuid::new_v4(),
            playback_url: None,
        };
        let post = Post {
            id: session.post_id,
            author_id: actor.user_id.clone(),
            body: title.to_string(),
            privacy,
            video_url: None,
            thumbnail_url: None,
            metadata: LiveMetadata {
                live_title: Some(title.to_string()),
                live_status: Some(SessionStatus::Live),
                live_channel: Some(channel),
                live_viewer_count: Some(0),
                ..Default::default()
            }
            .to_patch(),
            created_at: started_at,
        };

        let mut phase = CreatePhase::InsertPost;
        loop {
            if let Err(e) = self.create_phase(phase, &session, &post).await {
                error!(?phase, "Session create failed: {}", e);
                self.rollback_create(phase.previous(), &session, &post).await;
                return Err(e);
            }

            match phase.next() {
                Some(next) => phase = next,
                None => break,
            }
        }

        info!(session_id = %session.id, channel = %session.channel, "Live session created");
        Ok(session)
    }

    async fn create_phase(
        &self,
        phase: CreatePhase,
        session: &LiveSession,
        post: &Post,
    ) -> EngineResult<()> {
        debug!(?phase, "Create phase");

        match phase {
            CreatePhase::InsertPost => {
                self.posts.insert(post.id, post.clone()).await?;
            }
            CreatePhase::InsertSession => {
                self.sessions.insert(session.id, session.clone()).await?;
            }
            CreatePhase::BackfillMetadata => {
                let meta = LiveMetadata {
                    live_session_id: Some(session.id),
                    ..Default::default()
                };
                self.merge_post(post.id, &meta, None, None).await?;
            }
        }
        Ok(())
    }

    async fn rollback_create(&self, from: Option<CreatePhase>, session: &LiveSession, post: &Post) {
        let mut current = from;

        while let Some(phase) = current {
            info!(?phase, "Rolling back create phase");
            let result = match phase {
                CreatePhase::BackfillMetadata => Ok(()),
                CreatePhase::InsertSession => self.sessions.delete(session.id).await,
                CreatePhase::InsertPost => self.posts.delete(post.id).await,
            };
            if let Err(e) = result {
                error!(?phase, "Rollback failed: {}", e);
            }
            current = phase.previous();
        }
    }

    /// End a session. Sets `ended_at` once, records the recording
    /// outcome, then merges the end state and replay into the post.
    #[instrument(
        name = "session_finalize",
        skip(self, request),
        fields(recording_status = request.recording_status.as_str())
    )]
    pub async fn finalize(
        &self,
        session_id: SessionId,
        request: FinalizeRequest,
    ) -> EngineResult<LiveSession> {
        let current = self.require_session(session_id).await?;
        self.require_host(&current)?;
        if !current.is_live() {
            return Err(EngineError::SessionEnded(session_id));
        }
        let status = request.recording_status;
        if !current.recording_status.can_advance_to(status) {
            return Err(EngineError::InvalidTransition {
                from: current.recording_status,
                to: status,
            });
        }

        let ended_at = Utc::now();
        let playback_url = request.playback_url.clone();
        let session = update_with(self.sessions.as_ref(), session_id, self.max_retries, |s| {
            s.status = SessionStatus::Ended;
            if s.recording_status.can_advance_to(status) {
                s.recording_status = status;
            }
            s.ended_at.get_or_insert(ended_at);
            if playback_url.is_some() {
                s.playback_url = playback_url.clone();
            }
            Ok(())
        })
        .await
        .map_err(|e| missing(e, EngineError::SessionNotFound(session_id)))?
        .value;

        info!(
            %session_id,
            recording_status = session.recording_status.as_str(),
            "Live session ended"
        );

        let meta = LiveMetadata {
            live_status: Some(SessionStatus::Ended),
            live_ended_at: session.ended_at,
            live_playback_url: request.playback_url.clone(),
            ..Default::default()
        };
        self.merge_post(
            session.post_id,
            &meta,
            request.playback_url,
            request.thumbnail_url,
        )
        .await?;

        Ok(session)
    }

    /// Move the recording status forward. Backward moves are refused.
    pub async fn set_recording_status(
        &self,
        session_id: SessionId,
        status: RecordingStatus,
    ) -> EngineResult<LiveSession> {
        let current = self.require_session(session_id).await?;
        self.require_host(&current)?;
        if !current.recording_status.can_advance_to(status) {
            return Err(EngineError::InvalidTransition {
                from: current.recording_status,
                to: status,
            });
        }
        if current.recording_status == status {
            return Ok(current);
        }

        let row = update_with(self.sessions.as_ref(), session_id, self.max_retries, |s| {
            if s.recording_status.can_advance_to(status) {
                s.recording_status = status;
            }
            Ok(())
        })
        .await
        .map_err(|e| missing(e, EngineError::SessionNotFound(session_id)))?;

        debug!(%session_id, status = status.as_str(), "Recording status updated");
        Ok(row.value)
    }

    /// Write an absolute viewer count. Writing the current value is a
    /// no-op.
    pub async fn update_viewer_count(&self, session_id: SessionId, count: u32) -> EngineResult<u32> {
        let current = self.require_session(session_id).await?;
        if current.viewer_count == count {
            debug!(%session_id, count, "Viewer count unchanged, skipping write");
            return Ok(count);
        }
        self.adjust_viewers(session_id, move |_| count).await
    }

    pub async fn increment_viewers(&self, session_id: SessionId) -> EngineResult<u32> {
        self.adjust_viewers(session_id, |n| n.saturating_add(1)).await
    }

    /// Clamps at zero.
    pub async fn decrement_viewers(&self, session_id: SessionId) -> EngineResult<u32> {
        self.adjust_viewers(session_id, |n| n.saturating_sub(1)).await
    }

    async fn adjust_viewers(
        &self,
        session_id: SessionId,
        f: impl Fn(u32) -> u32 + Send + Sync,
    ) -> EngineResult<u32> {
        let row = update_with(self.sessions.as_ref(), session_id, self.max_retries, |s| {
            s.viewer_count = f(s.viewer_count);
            Ok(())
        })
        .await
        .map_err(|e| missing(e, EngineError::SessionNotFound(session_id)))?;

        let count = row.value.viewer_count;
        let meta = LiveMetadata {
            live_viewer_count: Some(count),
            ..Default::default()
        };
        self.merge_post(row.value.post_id, &meta, None, None).await?;

        debug!(%session_id, count, "Viewer count written");
        Ok(count)
    }

    async fn merge_post(
        &self,
        post_id: PostId,
        meta: &LiveMetadata,
        video_url: Option<String>,
        thumbnail_url: Option<String>,
    ) -> EngineResult<Post> {
        let patch = meta.to_patch();
        let row = update_with(self.posts.as_ref(), post_id, self.max_retries, |post| {
            merge_json(&mut post.metadata, &patch);
            if let Some(url) = &video_url {
                post.video_url = Some(url.clone());
            }
            if let Some(url) = &thumbnail_url {
                post.thumbnail_url = Some(url.clone());
            }
            Ok(())
        })
        .await
        .map_err(|e| missing(e, EngineError::PostNotFound(post_id)))?;

        Ok(row.value)
    }

    pub async fn get(&self, session_id: SessionId) -> EngineResult<Option<LiveSession>> {
        Ok(self.sessions.get(session_id).await?.map(|row| row.value))
    }

    pub async fn get_post(&self, post_id: PostId) -> EngineResult<Option<Post>> {
        Ok(self.posts.get(post_id).await?.map(|row| row.value))
    }

    /// Sessions currently live, oldest first.
    pub async fn list_active(&self) -> EngineResult<Vec<LiveSession>> {
        Ok(self
            .sessions
            .list()
            .await?
            .into_iter()
            .map(|row| row.value)
            .filter(LiveSession::is_live)
            .collect())
    }

    /// Changes to session records.
    pub fn subscribe(&self) -> broadcast::Receiver<Change<LiveSession>> {
        self.sessions.subscribe()
    }

    pub fn sessions(&self) -> Arc<dyn Table<LiveSession>> {
        Arc::clone(&self.sessions)
    }

    /// Mint a channel credential for `role` in a live session.
    pub async fn issue_credential(
        &self,
        session_id: SessionId,
        role: Role,
    ) -> EngineResult<AccessCredential> {
        self.mint_credential(session_id, role, None).await
    }

    /// Mint a credential for a participant already joined as `uid`.
    pub async fn renew_credential(
        &self,
        session_id: SessionId,
        role: Role,
        uid: u32,
    ) -> EngineResult<AccessCredential> {
        self.mint_credential(session_id, role, Some(uid)).await
    }

    async fn mint_credential(
        &self,
        session_id: SessionId,
        role: Role,
        joined_uid: Option<u32>,
    ) -> EngineResult<AccessCredential> {
        let session = self.require_session(session_id).await?;
        if !session.is_live() {
            return Err(EngineError::SessionEnded(session_id));
        }

        let mut reserved = vec![session.host_uid];
        reserved.extend(session.recorder_uid);
        let uid = match (role, joined_uid) {
            (Role::Host, uid) => {
                self.require_host(&session)?;
                match uid {
                    Some(uid) if uid != session.host_uid => {
                        return Err(EngineError::InvalidInput(format!(
                            "host uid {} does not match session",
                            uid
                        )));
                    }
                    _ => session.host_uid,
                }
            }
            (Role::Audience, Some(uid)) if uid == 0 || reserved.contains(&uid) => {
                return Err(EngineError::InvalidInput(format!(
                    "uid {} is reserved",
                    uid
                )));
            }
            (Role::Audience, Some(uid)) => uid,
            (Role::Audience, None) => audience_uid(&reserved),
        };

        let credential = self.tokens.issue(&session.channel, uid, role).await?;
        debug!(%session_id, ?role, uid, "Credential issued");
        Ok(credential)
    }

    async fn require_session(&self, session_id: SessionId) -> EngineResult<LiveSession> {
        self.get(session_id)
            .await?
            .ok_or(EngineError::SessionNotFound(session_id))
    }

    fn require_host(&self, session: &LiveSession) -> EngineResult<()> {
        if self.actor()?.user_id == session.host_user_id {
            Ok(())
        } else {
            Err(EngineError::NotHost)
        }
    }
}

#[async_trait]
impl CredentialProvider for LifecycleService {
    async fn request_access_credential(
        &self,
        session_id: SessionId,
        role: Role,
    ) -> ConnectionResult<AccessCredential> {
        self.issue_credential(session_id, role)
            .await
            .map_err(EngineError::into_connection_error)
    }

    async fn renew_access_credential(
        &self,
        session_id: SessionId,
        role: Role,
        uid: u32,
    ) -> ConnectionResult<AccessCredential> {
        self.renew_credential(session_id, role, uid)
            .await
            .map_err(EngineError::into_connection_error)
    }
}

fn missing(err: StoreError, replacement: EngineError) -> EngineError {
    if err.is_not_found() {
        replacement
    } else {
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::LoopbackTokenIssuer;
    use livecast_store::MemoryTable;
    use serde_json::json;

    struct Fixture {
        sessions: MemoryTable<LiveSession>,
        posts: MemoryTable<Post>,
        tokens: Arc<LoopbackTokenIssuer>,
        service: LifecycleService,
    }

    fn fixture() -> Fixture {
        let sessions = MemoryTable::new("live_sessions");
        let posts = MemoryTable::new("posts");
        let tokens = Arc::new(LoopbackTokenIssuer::default());
        let service = LifecycleService::new(
            Arc::new(sessions.clone()),
            Arc::new(posts.clone()),
            tokens.clone(),
            &StoreSettings::default(),
        )
        .with_actor(Actor::new("host-user"));

        Fixture {
            sessions,
            posts,
            tokens,
            service,
        }
    }

    #[tokio::test]
    async fn create_requires_actor_and_title() {
        let f = fixture();
        let anonymous = LifecycleService {
            actor: None,
            ..f.service.clone()
        };

        assert!(matches!(
            anonymous.create("Q&A", Privacy::Public).await,
            Err(EngineError::NotAuthenticated)
        ));
        assert!(matches!(
            f.service.create("   ", Privacy::Public).await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(f.posts.is_empty());
    }

    #[tokio::test]
    async fn create_backfills_session_id() {
        let f = fixture();
        let session = f.service.create("Q&A", Privacy::Followers).await.unwrap();
        let post = f.service.get_post(session.post_id).await.unwrap().unwrap();
        let meta = LiveMetadata::from_document(&post.metadata);

        assert_eq!(meta.live_session_id, Some(session.id));
        assert_eq!(meta.live_channel.as_deref(), Some(session.channel.as_str()));
        assert_eq!(post.privacy, Privacy::Followers);
        assert_eq!(session.host_uid, host_uid("host-user"));
        assert!(session.channel.starts_with("live_hostuser_"));
    }

    #[tokio::test]
    async fn backfill_failure_rolls_back_both_rows() {
        let f = fixture();
        f.posts.fail_next_updates(1);

        assert!(f.service.create("Q&A", Privacy::Public).await.is_err());
        assert!(f.posts.is_empty());
        assert!(f.sessions.is_empty());
    }

    #[tokio::test]
    async fn recording_status_only_moves_forward() {
        let f = fixture();
        let session = f.service.create("Q&A", Privacy::Public).await.unwrap();

        f.service
            .set_recording_status(session.id, RecordingStatus::Recording)
            .await
            .unwrap();
        let err = f
            .service
            .set_recording_status(session.id, RecordingStatus::Starting)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn viewer_count_clamps_and_mirrors() {
        let f = fixture();
        let session = f.service.create("Q&A", Privacy::Public).await.unwrap();

        assert_eq!(f.service.decrement_viewers(session.id).await.unwrap(), 0);
        assert_eq!(f.service.increment_viewers(session.id).await.unwrap(), 1);
        assert_eq!(f.service.increment_viewers(session.id).await.unwrap(), 2);
        assert_eq!(f.service.update_viewer_count(session.id, 7).await.unwrap(), 7);

        let post = f.service.get_post(session.post_id).await.unwrap().unwrap();
        assert_eq!(post.metadata_field("live_viewer_count"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn unchanged_viewer_count_is_not_written() {
        let f = fixture();
        let session = f.service.create("Q&A", Privacy::Public).await.unwrap();
        f.service.update_viewer_count(session.id, 3).await.unwrap();
        let version = f.sessions.get(session.id).await.unwrap().unwrap().version;

        f.service.update_viewer_count(session.id, 3).await.unwrap();

        assert_eq!(
            f.sessions.get(session.id).await.unwrap().unwrap().version,
            version
        );
    }

    #[tokio::test]
    async fn finalize_merges_into_foreign_metadata() {
        let f = fixture();
        let session = f.service.create("Q&A", Privacy::Public).await.unwrap();
        f.posts
            .update_now(session.post_id, |p| {
                merge_json(&mut p.metadata, &json!({"moderation": {"flagged": false}}))
            })
            .unwrap();

        let ended = f
            .service
            .finalize(session.id, FinalizeRequest::failed())
            .await
            .unwrap();
        let post = f.service.get_post(session.post_id).await.unwrap().unwrap();

        assert_eq!(ended.status, SessionStatus::Ended);
        assert_eq!(ended.recording_status, RecordingStatus::Failed);
        assert!(ended.ended_at.is_some());
        assert_eq!(post.metadata_field("live_status"), Some(&json!("ended")));
        assert_eq!(
            post.metadata_field("moderation"),
            Some(&json!({"flagged": false}))
        );
        assert_eq!(post.video_url, None);
    }

    #[tokio::test]
    async fn finalize_is_host_only_and_once() {
        let f = fixture();
        let session = f.service.create("Q&A", Privacy::Public).await.unwrap();
        let stranger = f.service.with_actor(Actor::new("someone-else"));

        assert!(matches!(
            stranger.finalize(session.id, FinalizeRequest::failed()).await,
            Err(EngineError::NotHost)
        ));

        f.service
            .finalize(session.id, FinalizeRequest::failed())
            .await
            .unwrap();
        assert!(matches!(
            f.service.finalize(session.id, FinalizeRequest::failed()).await,
            Err(EngineError::SessionEnded(_))
        ));
    }

    #[tokio::test]
    async fn credentials_respect_role_and_status() {
        let f = fixture();
        let session = f.service.create("Q&A", Privacy::Public).await.unwrap();
        let viewer = f.service.with_actor(Actor::new("viewer"));

        let host = f
            .service
            .issue_credential(session.id, Role::Host)
            .await
            .unwrap();
        assert_eq!(host.uid, session.host_uid);
        assert_eq!(host.channel, session.channel);

        let audience = viewer
            .issue_credential(session.id, Role::Audience)
            .await
            .unwrap();
        assert_ne!(audience.uid, session.host_uid);
        let renewed = viewer
            .renew_access_credential(session.id, Role::Audience, audience.uid)
            .await
            .unwrap();
        assert_eq!(renewed.uid, audience.uid);
        assert!(viewer
            .renew_credential(session.id, Role::Audience, session.host_uid)
            .await
            .is_err());
        assert!(matches!(
            viewer.issue_credential(session.id, Role::Host).await,
            Err(EngineError::NotHost)
        ));

        f.tokens.fail_next(1);
        let err = viewer
            .request_access_credential(session.id, Role::Audience)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        f.service
            .finalize(session.id, FinalizeRequest::failed())
            .await
            .unwrap();
        let err = viewer
            .request_access_credential(session.id, Role::Audience)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn list_active_excludes_ended() {
        let f = fixture();
        let a = f.service.create("A", Privacy::Public).await.unwrap();
        let b = f.service.create("B", Privacy::Public).await.unwrap();
        f.service.finalize(a.id, FinalizeRequest::failed()).await.unwrap();

        let active: Vec<_> = f
            .service
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(active, vec![b.id]);
    }
}
