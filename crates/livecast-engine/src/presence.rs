//! Viewer presence: the host's debounced absolute count, the audience's
//! enter/leave adjustments, and a heartbeat ledger that reclaims viewers
//! whose leave never arrived.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use livecast_ipc::SessionId;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::lifecycle::LifecycleService;
use crate::EngineResult;

/// Where viewer counts are written.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_viewer_count(&self, session_id: SessionId, count: u32) -> EngineResult<u32>;
    async fn increment_viewers(&self, session_id: SessionId) -> EngineResult<u32>;
    async fn decrement_viewers(&self, session_id: SessionId) -> EngineResult<u32>;
}

#[async_trait]
impl PresenceStore for LifecycleService {
    async fn set_viewer_count(&self, session_id: SessionId, count: u32) -> EngineResult<u32> {
        self.update_viewer_count(session_id, count).await
    }

    async fn increment_viewers(&self, session_id: SessionId) -> EngineResult<u32> {
        LifecycleService::increment_viewers(self, session_id).await
    }

    async fn decrement_viewers(&self, session_id: SessionId) -> EngineResult<u32> {
        LifecycleService::decrement_viewers(self, session_id).await
    }
}

/// Debounces transport-observed counts into absolute writes on the host
/// side. At most one write per window, and never a write of the value
/// last written.
pub struct ViewerCountSyncer {
    tx: watch::Sender<u32>,
    token: CancellationToken,
}

impl ViewerCountSyncer {
    pub fn spawn(store: Arc<dyn PresenceStore>, session_id: SessionId, debounce: Duration) -> Self {
        let (tx, rx) = watch::channel(0);
        let token = CancellationToken::new();
        tokio::spawn(sync_counts(store, session_id, debounce, rx, token.clone()));
        Self { tx, token }
    }

    /// Record the latest observed count.
    pub fn report(&self, count: u32) {
        self.tx.send_if_modified(|current| {
            if *current == count {
                false
            } else {
                *current = count;
                true
            }
        });
    }

    /// Stop syncing. A pending write is dropped.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for ViewerCountSyncer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn sync_counts(
    store: Arc<dyn PresenceStore>,
    session_id: SessionId,
    debounce: Duration,
    mut rx: watch::Receiver<u32>,
    token: CancellationToken,
) {
    let mut last_written = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            changed = rx.changed() => if changed.is_err() { break },
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(debounce) => {}
        }

        let count = *rx.borrow_and_update();
        if last_written == Some(count) {
            trace!(count, "Viewer count unchanged since last write");
            continue;
        }
        match store.set_viewer_count(session_id, count).await {
            Ok(_) => last_written = Some(count),
            Err(e) => warn!(%session_id, count, "Viewer count write failed: {}", e),
        }
    }
    debug!(%session_id, "Viewer count sync stopped");
}

/// Tracks viewer heartbeats and decrements the count for viewers that
/// stopped sending them.
pub struct PresenceLedger {
    store: Arc<dyn PresenceStore>,
    timeout: Duration,
    entries: Mutex<HashMap<(SessionId, Uuid), Instant>>,
}

impl PresenceLedger {
    pub fn new(store: Arc<dyn PresenceStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking a viewer that was just counted.
    pub fn track(&self, session_id: SessionId, viewer_id: Uuid) {
        self.entries
            .lock()
            .insert((session_id, viewer_id), Instant::now());
    }

    /// Refresh a viewer. Returns false if the viewer is not tracked (never
    /// entered, or already swept).
    pub fn heartbeat(&self, session_id: SessionId, viewer_id: Uuid) -> bool {
        match self.entries.lock().get_mut(&(session_id, viewer_id)) {
            Some(seen) => {
                *seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Stop tracking a viewer. Returns false if it was already swept.
    pub fn remove(&self, session_id: SessionId, viewer_id: Uuid) -> bool {
        self.entries
            .lock()
            .remove(&(session_id, viewer_id))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decrement once for every viewer silent longer than the timeout.
    #[instrument(name = "presence_sweep", skip(self))]
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(SessionId, Uuid)> = {
            let mut entries = self.entries.lock();
            let expired: Vec<_> = entries
                .iter()
                .filter(|(_, seen)| now.duration_since(**seen) > self.timeout)
                .map(|(key, _)| *key)
                .collect();
            for key in &expired {
                entries.remove(key);
            }
            expired
        };

        for (session_id, viewer_id) in &expired {
            info!(%session_id, %viewer_id, "Viewer heartbeat expired");
            if let Err(e) = self.store.decrement_viewers(*session_id).await {
                warn!(%session_id, "Expired viewer decrement failed: {}", e);
            }
        }
        expired.len()
    }

    /// Sweep every `interval` until cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        ledger.sweep().await;
                    }
                }
            }
        })
    }
}

/// One viewer's contribution to a session's count. Enters at most once
/// and leaves at most once.
pub struct AudiencePresence {
    store: Arc<dyn PresenceStore>,
    ledger: Option<Arc<PresenceLedger>>,
    session_id: SessionId,
    viewer_id: Uuid,
    entered: AtomicBool,
}

impl AudiencePresence {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        ledger: Option<Arc<PresenceLedger>>,
        session_id: SessionId,
    ) -> Self {
        Self {
            store,
            ledger,
            session_id,
            viewer_id: Uuid::new_v4(),
            entered: AtomicBool::new(false),
        }
    }

    pub fn is_entered(&self) -> bool {
        self.entered.load(Ordering::SeqCst)
    }

    /// Count this viewer in. A no-op if already entered.
    pub async fn enter(&self) -> EngineResult<()> {
        if self.entered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.store.increment_viewers(self.session_id).await {
            Ok(count) => {
                if let Some(ledger) = &self.ledger {
                    ledger.track(self.session_id, self.viewer_id);
                }
                debug!(session_id = %self.session_id, count, "Viewer entered");
                Ok(())
            }
            Err(e) => {
                self.entered.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Keep this viewer alive in the ledger. A viewer swept while
    /// unreachable is counted back in.
    pub async fn heartbeat(&self) -> EngineResult<()> {
        let Some(ledger) = &self.ledger else {
            return Ok(());
        };
        if !self.is_entered() || ledger.heartbeat(self.session_id, self.viewer_id) {
            return Ok(());
        }

        debug!(session_id = %self.session_id, "Viewer was swept, entering again");
        self.store.increment_viewers(self.session_id).await?;
        ledger.track(self.session_id, self.viewer_id);
        Ok(())
    }

    /// Count this viewer out. A no-op if not entered or already swept.
    pub async fn leave(&self) {
        if !self.take_leave() {
            return;
        }
        match self.store.decrement_viewers(self.session_id).await {
            Ok(count) => debug!(session_id = %self.session_id, count, "Viewer left"),
            Err(e) => warn!(session_id = %self.session_id, "Viewer decrement failed: {}", e),
        }
    }

    /// Clears the entered flag; true if a decrement is owed.
    fn take_leave(&self) -> bool {
        if !self.entered.swap(false, Ordering::SeqCst) {
            return false;
        }
        match &self.ledger {
            Some(ledger) if !ledger.remove(self.session_id, self.viewer_id) => {
                debug!(session_id = %self.session_id, "Viewer already swept");
                false
            }
            _ => true,
        }
    }
}

impl Drop for AudiencePresence {
    fn drop(&mut self) {
        if !self.take_leave() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(session_id = %self.session_id, "No runtime for viewer decrement");
            return;
        };

        let store = Arc::clone(&self.store);
        let session_id = self.session_id;
        handle.spawn(async move {
            if let Err(e) = store.decrement_viewers(session_id).await {
                warn!(%session_id, "Viewer decrement on drop failed: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct CountingStore {
        count: AtomicU32,
        writes: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl PresenceStore for CountingStore {
        async fn set_viewer_count(&self, _: SessionId, count: u32) -> EngineResult<u32> {
            self.count.store(count, Ordering::SeqCst);
            self.writes.lock().push(count);
            Ok(count)
        }

        async fn increment_viewers(&self, _: SessionId) -> EngineResult<u32> {
            Ok(self.count.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn decrement_viewers(&self, _: SessionId) -> EngineResult<u32> {
            let previous = self
                .count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
                .unwrap_or(0);
            Ok(previous.saturating_sub(1))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn syncer_writes_latest_value_once_per_window() {
        let store = Arc::new(CountingStore::default());
        let syncer = ViewerCountSyncer::spawn(store.clone(), Uuid::new_v4(), Duration::from_secs(1));

        syncer.report(1);
        syncer.report(2);
        syncer.report(3);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(*store.writes.lock(), vec![3]);

        syncer.report(4);
        syncer.report(3);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(*store.writes.lock(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_syncer_writes_nothing() {
        let store = Arc::new(CountingStore::default());
        let syncer = ViewerCountSyncer::spawn(store.clone(), Uuid::new_v4(), Duration::from_secs(1));

        syncer.report(5);
        syncer.stop();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(store.writes.lock().is_empty());
    }

    #[tokio::test]
    async fn enter_and_leave_count_once() {
        let store = Arc::new(CountingStore::default());
        let presence = AudiencePresence::new(store.clone(), None, Uuid::new_v4());

        presence.enter().await.unwrap();
        presence.enter().await.unwrap();
        assert_eq!(store.count.load(Ordering::SeqCst), 1);

        presence.leave().await;
        presence.leave().await;
        assert_eq!(store.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn swept_viewer_is_not_decremented_twice() {
        let store = Arc::new(CountingStore::default());
        let session_id = Uuid::new_v4();
        let ledger = Arc::new(PresenceLedger::new(store.clone(), Duration::from_secs(30)));
        let a = AudiencePresence::new(store.clone(), Some(ledger.clone()), session_id);
        let b = AudiencePresence::new(store.clone(), Some(ledger.clone()), session_id);
        a.enter().await.unwrap();
        b.enter().await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        b.heartbeat().await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(ledger.sweep().await, 1);
        assert_eq!(store.count.load(Ordering::SeqCst), 1);

        a.leave().await;
        assert_eq!(store.count.load(Ordering::SeqCst), 1);
        b.leave().await;
        assert_eq!(store.count.load(Ordering::SeqCst), 0);
        assert!(ledger.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn swept_viewer_reenters_on_heartbeat() {
        let store = Arc::new(CountingStore::default());
        let session_id = Uuid::new_v4();
        let ledger = Arc::new(PresenceLedger::new(store.clone(), Duration::from_secs(30)));
        let presence = AudiencePresence::new(store.clone(), Some(ledger.clone()), session_id);
        presence.enter().await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        ledger.sweep().await;
        assert_eq!(store.count.load(Ordering::SeqCst), 0);

        presence.heartbeat().await.unwrap();
        assert_eq!(store.count.load(Ordering::SeqCst), 1);
        presence.leave().await;
        assert_eq!(store.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropped_presence_decrements() {
        let store = Arc::new(CountingStore::default());
        let presence = AudiencePresence::new(store.clone(), None, Uuid::new_v4());
        presence.enter().await.unwrap();

        drop(presence);
        tokio::task::yield_now().await;

        assert_eq!(store.count.load(Ordering::SeqCst), 0);
    }
}
