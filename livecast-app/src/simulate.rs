//! One broadcast from start to replay, with a single viewer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use livecast_engine::{
    HostBroadcast, HostDeps, LifecycleService, LoopbackTokenIssuer, PassthroughTranscoder,
    PresenceLedger, SampleThumbnailer, SessionCache, ViewerDeps, ViewerSession,
};
use livecast_ipc::{Actor, BroadcastEvent, LiveSession, LivecastConfig, Post, Privacy};
use livecast_store::{MemoryObjectStorage, MemoryTable};
use livecast_transport::{LoopbackHub, SyntheticDevices};
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

const SITE: &str = "https://livecast.local/";
const ON_AIR: Duration = Duration::from_secs(3);

struct Backends {
    hub: LoopbackHub,
    sessions: MemoryTable<LiveSession>,
    posts: MemoryTable<Post>,
    tokens: Arc<LoopbackTokenIssuer>,
    storage: Arc<MemoryObjectStorage>,
}

impl Backends {
    fn new(site: &Url) -> Self {
        Self {
            hub: LoopbackHub::new(),
            sessions: MemoryTable::new("live_sessions"),
            posts: MemoryTable::new("posts"),
            tokens: Arc::new(LoopbackTokenIssuer::default()),
            storage: Arc::new(MemoryObjectStorage::new(site.clone())),
        }
    }

    fn lifecycle(&self, user: &str, config: &LivecastConfig) -> LifecycleService {
        LifecycleService::new(
            Arc::new(self.sessions.clone()),
            Arc::new(self.posts.clone()),
            self.tokens.clone(),
            &config.store,
        )
        .with_actor(Actor::new(user))
    }
}

pub async fn run(config: LivecastConfig, events: Sender<BroadcastEvent>) -> Result<()> {
    let site = Url::parse(SITE).context("site url")?;
    let backends = Backends::new(&site);
    let cache = Arc::new(SessionCache::new(Arc::new(backends.sessions.clone())));

    let ledger = Arc::new(PresenceLedger::new(
        Arc::new(backends.lifecycle("presence-sweeper", &config)),
        config.presence.heartbeat_timeout(),
    ));
    let sweeper_token = CancellationToken::new();
    let sweeper = ledger.spawn_sweeper(config.presence.sweep_interval(), sweeper_token.clone());

    let host = HostBroadcast::create(
        "Simulated Q&A",
        Privacy::Public,
        HostDeps {
            lifecycle: backends.lifecycle("host", &config),
            client: Arc::new(backends.hub.client()),
            devices: Arc::new(SyntheticDevices::new()),
            storage: backends.storage.clone(),
            transcoder: Arc::new(PassthroughTranscoder::default()),
            thumbnails: Arc::new(SampleThumbnailer::default()),
            config: config.clone(),
            events: Some(events.clone()),
        },
    )
    .await
    .context("creating session")?;
    host.start().await.context("going live")?;
    info!(share_url = %host.share_url(&site)?, "On air");

    let viewer = ViewerSession::open(
        host.session().id,
        ViewerDeps {
            lifecycle: backends.lifecycle("viewer", &config),
            cache,
            client: Arc::new(backends.hub.client()),
            ledger: Some(ledger.clone()),
            config: config.clone(),
            events: Some(events),
        },
    )
    .await
    .context("opening viewer")?;
    viewer.start().await.context("joining as viewer")?;

    tokio::time::sleep(ON_AIR).await;
    info!(viewers = host.viewer_count(), "Ending broadcast");

    let outcome = host.end().await.context("ending broadcast")?;
    match &outcome.failure {
        Some(failure) => info!(kind = ?failure.kind, reason = %failure.reason, "Replay unavailable"),
        None => info!(
            playback_url = outcome.playback_url.as_deref().unwrap_or_default(),
            "Replay ready"
        ),
    }

    viewer.leave().await;
    sweeper_token.cancel();
    sweeper.await.context("presence sweeper")?;
    info!(
        sessions = backends.sessions.len(),
        objects = backends.storage.len(),
        "Simulation complete"
    );
    Ok(())
}
