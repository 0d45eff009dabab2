//! Channel token minting.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use livecast_ipc::{AccessCredential, Role};
use uuid::Uuid;

use crate::error::EngineError;
use crate::EngineResult;

/// Mints signed channel tokens. Implemented by the external credential
/// service.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, channel: &str, uid: u32, role: Role) -> EngineResult<AccessCredential>;
}

/// Issues unsigned tokens for the in-process transport.
pub struct LoopbackTokenIssuer {
    app_id: String,
    ttl: Duration,
    failing: AtomicU32,
}

impl LoopbackTokenIssuer {
    pub fn new(app_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            app_id: app_id.into(),
            ttl,
            failing: AtomicU32::new(0),
        }
    }

    /// Make the next `count` requests fail.
    pub fn fail_next(&self, count: u32) {
        self.failing.store(count, Ordering::SeqCst);
    }
}

impl Default for LoopbackTokenIssuer {
    fn default() -> Self {
        Self::new("loopback", Duration::hours(1))
    }
}

#[async_trait]
impl TokenIssuer for LoopbackTokenIssuer {
    async fn issue(&self, channel: &str, uid: u32, role: Role) -> EngineResult<AccessCredential> {
        if self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::Token("token service unavailable".to_string()));
        }

        Ok(AccessCredential {
            app_id: self.app_id.clone(),
            token: format!("{}.{:?}.{}", uid, role, Uuid::new_v4().simple()),
            uid,
            channel: channel.to_string(),
            expires_at: Utc::now() + self.ttl,
        })
    }
}
