//! Typed core<->UI messages for live broadcast sessions.
//!
//! This crate defines the records shared by every layer of the broadcast
//! core (sessions, posts, credentials), the status enums the UI renders,
//! and the event channel the page controllers report through.

mod config;
mod events;
mod state;
mod types;

pub use config::{
    LivecastConfig, PipelineSettings, PresenceSettings, ReconnectSettings, RenewalSettings,
    StoreSettings,
};
pub use events::{BroadcastEvent, PipelineStage};
pub use state::{AudienceStatus, ErrorKind, HostStatus, RecordingStatus, SessionStatus};
pub use types::{
    AccessCredential, Actor, LiveMetadata, LiveSession, Post, PostId, Privacy, Role, SessionId,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for events (core → UI).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<BroadcastEvent>, Receiver<BroadcastEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
