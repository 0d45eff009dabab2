//! Records shared across the broadcast core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::state::{RecordingStatus, SessionStatus};

/// Identifier of a live session record.
pub type SessionId = Uuid;

/// Identifier of a feed post.
pub type PostId = Uuid;

/// The signed-in user on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Platform user id.
    pub user_id: String,

    /// Name shown in the feed, if known.
    pub display_name: Option<String>,
}

impl Actor {
    /// Create an actor for the given user id.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
        }
    }
}

/// Participant role within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Publishes local camera and microphone.
    Host,

    /// Subscribes to the host's tracks.
    Audience,
}

/// Who can see the paired post.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privacy {
    #[default]
    Public,
    Followers,
    Private,
}

/// Short-lived proof of authorization to join a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCredential {
    /// Transport application id.
    pub app_id: String,

    /// Opaque token.
    pub token: String,

    /// Numeric participant id inside the channel.
    pub uid: u32,

    /// Channel the token is valid for.
    pub channel: String,

    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
}

/// The authoritative record of one broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSession {
    pub id: SessionId,

    /// Platform user id of the host.
    pub host_user_id: String,

    /// Transport channel, unique per broadcast.
    pub channel: String,

    /// Numeric transport id of the host.
    pub host_uid: u32,

    /// Numeric transport id reserved for a recording participant.
    pub recorder_uid: Option<u32>,

    pub title: String,
    pub privacy: Privacy,
    pub status: SessionStatus,
    pub recording_status: RecordingStatus,

    /// Eventually consistent viewer counter. Never negative.
    pub viewer_count: u32,

    pub started_at: DateTime<Utc>,

    /// Set once, when the session is finalized.
    pub ended_at: Option<DateTime<Utc>>,

    /// The paired feed post.
    pub post_id: PostId,

    /// Replay URL, once uploaded.
    pub playback_url: Option<String>,
}

impl LiveSession {
    /// Returns true while the broadcast is live.
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}

/// A feed post. Only the live metadata keys and the video reference are
/// maintained by the broadcast core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub author_id: String,
    pub body: String,
    pub privacy: Privacy,

    /// Primary video reference rendered by the feed.
    pub video_url: Option<String>,

    pub thumbnail_url: Option<String>,

    /// Free-form metadata document shared with other writers.
    pub metadata: Value,

    pub created_at: DateTime<Utc>,
}

impl Post {
    /// Returns a metadata field, if present.
    pub fn metadata_field(&self, key: &str) -> Option<&Value> {
        self.metadata.as_object().and_then(|m| m.get(key))
    }
}

/// The live-broadcast keys mirrored from a session into its post.
///
/// Every field is optional so the struct doubles as a merge patch: only
/// populated fields are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_status: Option<SessionStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_channel: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_session_id: Option<SessionId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_viewer_count: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_ended_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_playback_url: Option<String>,
}

impl LiveMetadata {
    /// Convert into a JSON object suitable for a merge patch.
    pub fn to_patch(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(value @ Value::Object(_)) => value,
            _ => Value::Object(Map::new()),
        }
    }

    /// Read the live keys back out of a post's metadata document.
    pub fn from_document(document: &Value) -> Self {
        serde_json::from_value(document.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_metadata_patch_skips_unset_fields() {
        let patch = LiveMetadata {
            live_viewer_count: Some(3),
            ..Default::default()
        }
        .to_patch();

        let object = patch.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert_eq!(object["live_viewer_count"], 3);
    }

    #[test]
    fn live_metadata_ignores_foreign_keys() {
        let document = serde_json::json!({
            "live_status": "ended",
            "moderation": { "flagged": false },
        });

        let meta = LiveMetadata::from_document(&document);
        assert_eq!(meta.live_status, Some(SessionStatus::Ended));
        assert_eq!(meta.live_title, None);
    }
}
