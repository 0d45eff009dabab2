//! Read-side cache of live sessions, kept fresh by the table's change feed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use livecast_ipc::{LiveSession, SessionId};
use livecast_store::{Change, Table};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::EngineResult;

struct Inner {
    table: Arc<dyn Table<LiveSession>>,
    entries: Mutex<HashMap<SessionId, LiveSession>>,
    active: Mutex<Option<Vec<LiveSession>>>,
    watchers: Mutex<HashMap<SessionId, watch::Sender<Option<LiveSession>>>>,
    loads: AtomicU64,
}

impl Inner {
    fn apply(&self, change: Change<LiveSession>) {
        trace!(id = %change.id, kind = ?change.kind, version = change.version, "Session change");

        {
            let mut entries = self.entries.lock();
            match &change.value {
                Some(session) => entries.insert(change.id, session.clone()),
                None => entries.remove(&change.id),
            };
        }
        *self.active.lock() = None;

        let mut watchers = self.watchers.lock();
        if let Some(tx) = watchers.get(&change.id) {
            if tx.receiver_count() == 0 {
                watchers.remove(&change.id);
            } else {
                tx.send_replace(change.value);
            }
        }
    }

    /// Drop everything and reload what is being watched.
    async fn resync(&self) {
        self.entries.lock().clear();
        *self.active.lock() = None;

        let ids: Vec<SessionId> = {
            let mut watchers = self.watchers.lock();
            watchers.retain(|_, tx| tx.receiver_count() > 0);
            watchers.keys().copied().collect()
        };

        for id in ids {
            match self.table.get(id).await {
                Ok(row) => {
                    let value = row.map(|r| r.value);
                    if let Some(tx) = self.watchers.lock().get(&id) {
                        tx.send_replace(value);
                    }
                }
                Err(e) => warn!(%id, "Resync of watched session failed: {}", e),
            }
        }
    }
}

/// Cache over the session table. Entries are invalidated by change
/// notifications, never by time.
pub struct SessionCache {
    inner: Arc<Inner>,
    token: CancellationToken,
}

impl SessionCache {
    /// Create the cache and start following the change feed. Must be
    /// called inside a tokio runtime.
    pub fn new(table: Arc<dyn Table<LiveSession>>) -> Self {
        let changes = table.subscribe();
        let inner = Arc::new(Inner {
            table,
            entries: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            watchers: Mutex::new(HashMap::new()),
            loads: AtomicU64::new(0),
        });
        let token = CancellationToken::new();

        tokio::spawn(follow_changes(Arc::clone(&inner), changes, token.clone()));

        Self { inner, token }
    }

    pub async fn get(&self, session_id: SessionId) -> EngineResult<Option<LiveSession>> {
        if let Some(session) = self.inner.entries.lock().get(&session_id) {
            return Ok(Some(session.clone()));
        }

        self.inner.loads.fetch_add(1, Ordering::Relaxed);
        let loaded = self.inner.table.get(session_id).await?.map(|row| row.value);
        if let Some(session) = &loaded {
            self.inner
                .entries
                .lock()
                .entry(session_id)
                .or_insert_with(|| session.clone());
        }
        Ok(loaded)
    }

    /// Live sessions, oldest first.
    pub async fn list_active(&self) -> EngineResult<Vec<LiveSession>> {
        if let Some(active) = self.inner.active.lock().as_ref() {
            return Ok(active.clone());
        }

        self.inner.loads.fetch_add(1, Ordering::Relaxed);
        let active: Vec<LiveSession> = self
            .inner
            .table
            .list()
            .await?
            .into_iter()
            .map(|row| row.value)
            .filter(LiveSession::is_live)
            .collect();
        *self.inner.active.lock() = Some(active.clone());
        Ok(active)
    }

    /// Follow one session. The receiver sees the current record and every
    /// later change; `None` means the record does not exist.
    pub async fn watch_session(
        &self,
        session_id: SessionId,
    ) -> EngineResult<watch::Receiver<Option<LiveSession>>> {
        let rx = {
            let mut watchers = self.inner.watchers.lock();
            match watchers.get(&session_id) {
                Some(tx) if tx.borrow().is_some() => return Ok(tx.subscribe()),
                Some(tx) => tx.subscribe(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    watchers.insert(session_id, tx);
                    rx
                }
            }
        };

        let current = self.get(session_id).await?;
        if let Some(tx) = self.inner.watchers.lock().get(&session_id) {
            // A change that landed while loading is newer than `current`.
            tx.send_if_modified(|value| {
                if value.is_none() && current.is_some() {
                    *value = current;
                    true
                } else {
                    false
                }
            });
        }

        debug!(%session_id, "Watching session");
        Ok(rx)
    }

    /// Number of reads that went to the table.
    pub fn load_count(&self) -> u64 {
        self.inner.loads.load(Ordering::Relaxed)
    }
}

impl Drop for SessionCache {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn follow_changes(
    inner: Arc<Inner>,
    mut changes: broadcast::Receiver<Change<LiveSession>>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            change = changes.recv() => match change {
                Ok(change) => inner.apply(change),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session change feed lagged, resyncing");
                    inner.resync().await;
                }
                Err(RecvError::Closed) => {
                    debug!("Session change feed closed");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{FinalizeRequest, LifecycleService};
    use crate::tokens::LoopbackTokenIssuer;
    use livecast_ipc::{Actor, Post, Privacy, SessionStatus, StoreSettings};
    use livecast_store::MemoryTable;

    fn service() -> (LifecycleService, SessionCache) {
        let sessions = Arc::new(MemoryTable::<LiveSession>::new("live_sessions"));
        let posts = Arc::new(MemoryTable::<Post>::new("posts"));
        let service = LifecycleService::new(
            sessions.clone(),
            posts,
            Arc::new(LoopbackTokenIssuer::default()),
            &StoreSettings::default(),
        )
        .with_actor(Actor::new("host"));
        let cache = SessionCache::new(sessions);
        (service, cache)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn repeated_reads_hit_the_cache() {
        let (service, cache) = service();
        let session = service.create("Q&A", Privacy::Public).await.unwrap();
        settle().await;

        cache.get(session.id).await.unwrap();
        cache.get(session.id).await.unwrap();
        cache.list_active().await.unwrap();
        cache.list_active().await.unwrap();

        assert_eq!(cache.load_count(), 1);
    }

    #[tokio::test]
    async fn change_invalidates_active_list() {
        let (service, cache) = service();
        let session = service.create("Q&A", Privacy::Public).await.unwrap();
        assert_eq!(cache.list_active().await.unwrap().len(), 1);

        service
            .finalize(session.id, FinalizeRequest::failed())
            .await
            .unwrap();
        settle().await;

        assert!(cache.list_active().await.unwrap().is_empty());
        assert_eq!(
            cache.get(session.id).await.unwrap().unwrap().status,
            SessionStatus::Ended
        );
    }

    #[tokio::test]
    async fn watchers_see_updates() {
        let (service, cache) = service();
        let session = service.create("Q&A", Privacy::Public).await.unwrap();
        let mut rx = cache.watch_session(session.id).await.unwrap();
        settle().await;
        assert!(rx.borrow_and_update().as_ref().unwrap().is_live());

        service.increment_viewers(session.id).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().viewer_count, 1);

        service
            .finalize(session.id, FinalizeRequest::failed())
            .await
            .unwrap();
        rx.changed().await.unwrap();
        assert!(!rx.borrow().as_ref().unwrap().is_live());
    }

    #[tokio::test]
    async fn watching_a_missing_session_yields_none() {
        let (_service, cache) = service();
        let rx = cache.watch_session(uuid::Uuid::new_v4()).await.unwrap();
        assert!(rx.borrow().is_none());
    }
}
