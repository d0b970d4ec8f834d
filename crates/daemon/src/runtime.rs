// Supervisor: owns the listener lifecycle and the periodic health check.
//
// The feed connection is an owned handle with an open/close lifecycle;
// every restart builds a fresh transport. On each health-check round,
// anything but `Subscribed` tears the listener down and starts a new one,
// while a healthy subscription gets a periodic catch-up refetch. The
// listener itself never self-heals.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::service::{ApiConfig, HttpApi};
use crate::settings::{settings_path, CheckpointStore, SettingsHandle};
use crate::store::FsStore;
use crate::sync::listener::{self, ChannelStatus, FeedTransport, ListenerHandle};
use crate::sync::ws::{WsFeedTransport, DEFAULT_FEED_URL};
use crate::sync::{ProgressSink, SyncContext, SyncPaths};

/// Default period of the supervisor health check.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Builds a fresh transport for every (re)connect.
pub type TransportFactory = Box<dyn Fn() -> Box<dyn FeedTransport> + Send>;

pub struct Supervisor {
    ctx: Arc<SyncContext>,
    transports: TransportFactory,
    interval: Duration,
    handle: Option<ListenerHandle>,
}

impl Supervisor {
    pub fn new(ctx: Arc<SyncContext>, transports: TransportFactory, interval: Duration) -> Self {
        Self { ctx, transports, interval, handle: None }
    }

    /// Status of the current listener, if one is running.
    pub fn listener_status(&self) -> Option<ChannelStatus> {
        self.handle.as_ref().map(ListenerHandle::last_status)
    }

    /// Open a fresh subscription.
    pub async fn start(&mut self) -> Result<()> {
        let transport = (self.transports)();
        self.handle = Some(listener::start(Arc::clone(&self.ctx), transport).await?);
        Ok(())
    }

    /// One health-check round: restart a dropped subscription, or kick a
    /// periodic catch-up refetch on a healthy one.
    pub async fn tick(&mut self) -> Result<()> {
        match &self.handle {
            None => self.start().await,
            Some(handle) if handle.last_status() != ChannelStatus::Subscribed => {
                warn!(status = ?handle.last_status(), "feed unhealthy, restarting listener");
                if let Some(old) = self.handle.take() {
                    old.stop();
                }
                self.start().await
            }
            Some(handle) => {
                handle.start_refetch();
                Ok(())
            }
        }
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
    }

    /// Run until ctrl-c: subscribe, then health-check on the interval.
    pub async fn run_until_shutdown(mut self) -> Result<()> {
        self.start().await?;
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await; // the immediate first tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(error) = self.tick().await {
                        warn!(%error, "health check failed");
                    }
                }
                result = tokio::signal::ctrl_c() => {
                    result.context("failed to listen for ctrl-c")?;
                    info!("shutting down sync daemon");
                    self.stop();
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Stable per-process origin tag for loopback suppression.
fn client_source_id() -> String {
    format!("notelens-{}", Uuid::new_v4())
}

fn validate_service_url(value: &str) -> Result<()> {
    let parsed =
        Url::parse(value).map_err(|error| anyhow!("invalid service_url `{value}`: {error}"))?;
    match parsed.scheme() {
        "https" => Ok(()),
        "http" if is_loopback_host(parsed.host_str()) => Ok(()),
        _ => Err(anyhow!("service_url must use https (http is allowed only for localhost testing)")),
    }
}

fn validate_feed_url(value: &str) -> Result<()> {
    let parsed =
        Url::parse(value).map_err(|error| anyhow!("invalid feed_url `{value}`: {error}"))?;
    match parsed.scheme() {
        "wss" => Ok(()),
        "ws" if is_loopback_host(parsed.host_str()) => Ok(()),
        _ => Err(anyhow!("feed_url must use wss (ws is allowed only for localhost testing)")),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}

/// Assemble the sync context from persisted settings.
pub fn build_context(
    settings: &Arc<SettingsHandle>,
    progress: ProgressSink,
) -> Result<Arc<SyncContext>> {
    let snapshot = settings.snapshot();
    if snapshot.access_token.is_empty() {
        bail!("not logged in: run `notelens login <access-key>` first");
    }
    let vault = snapshot
        .vault_path
        .clone()
        .ok_or_else(|| anyhow!("vault_path is not configured in settings"))?;

    let mut config = ApiConfig::new(snapshot.access_token.clone());
    if let Some(url) = &snapshot.service_url {
        validate_service_url(url)?;
        config = config.with_base_url(url.clone());
    }

    Ok(Arc::new(SyncContext {
        api: Arc::new(HttpApi::new(config)),
        store: Arc::new(FsStore::new(vault)),
        checkpoints: Arc::clone(settings) as Arc<dyn CheckpointStore>,
        paths: SyncPaths::new(snapshot.sync_path.clone()),
        progress,
        source_id: client_source_id(),
    }))
}

/// Entry point for `notelensd`: respects the `auto_sync` setting.
pub async fn run_daemon() -> Result<()> {
    run(true).await
}

/// Entry point for `notelens listen`: an explicit request, so `auto_sync`
/// is not consulted.
pub async fn run_listener() -> Result<()> {
    run(false).await
}

async fn run(require_auto_sync: bool) -> Result<()> {
    let path = settings_path().ok_or_else(|| anyhow!("could not determine home directory"))?;
    let settings = Arc::new(SettingsHandle::open(path));
    let snapshot = settings.snapshot();
    if require_auto_sync && !snapshot.auto_sync {
        info!("auto sync is disabled, nothing to do");
        return Ok(());
    }

    let progress: ProgressSink = Arc::new(|line: &str| info!(status = line, "sync progress"));
    let ctx = build_context(&settings, progress)?;

    let feed_url = snapshot.feed_url.clone().unwrap_or_else(|| DEFAULT_FEED_URL.to_string());
    validate_feed_url(&feed_url)?;
    let supervisor = Supervisor::new(
        ctx,
        Box::new(move || Box::new(WsFeedTransport::new(feed_url.clone())) as Box<dyn FeedTransport>),
        HEALTH_CHECK_INTERVAL,
    );
    supervisor.run_until_shutdown().await
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::sync::listener::FeedEvent;
    use crate::testutil::{test_context, TestContext};

    use super::*;

    /// Plays back scripted events, then parks forever.
    struct ScriptTransport {
        events: VecDeque<Result<FeedEvent, String>>,
    }

    #[async_trait]
    impl FeedTransport for ScriptTransport {
        async fn connect(&mut self, _token: &str) -> Result<()> {
            Ok(())
        }

        async fn next_event(&mut self) -> Result<Option<FeedEvent>> {
            match self.events.pop_front() {
                Some(Ok(event)) => Ok(Some(event)),
                Some(Err(message)) => bail!("{message}"),
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {}
    }

    fn scripted_factory(
        scripts: Vec<Vec<Result<FeedEvent, String>>>,
    ) -> (TransportFactory, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let scripts = Arc::new(StdMutex::new(VecDeque::from(scripts)));
        let factory: TransportFactory = Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let events = scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default()
                .into_iter()
                .collect();
            Box::new(ScriptTransport { events })
        });
        (factory, created)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn unhealthy_listener_is_restarted_on_tick() {
        let TestContext { ctx, vault: _vault, .. } = test_context();
        let (factory, created) =
            scripted_factory(vec![vec![Err("socket reset".to_string())], vec![]]);

        let mut supervisor = Supervisor::new(ctx, factory, HEALTH_CHECK_INTERVAL);
        supervisor.start().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);

        {
            let status = || supervisor.listener_status();
            wait_until(move || status() == Some(ChannelStatus::ChannelError)).await;
        }

        supervisor.tick().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.listener_status(), Some(ChannelStatus::Subscribed));

        supervisor.stop();
    }

    #[tokio::test]
    async fn healthy_listener_gets_periodic_refetch() {
        let TestContext { ctx, api, vault: _vault, .. } = test_context();
        let (factory, created) = scripted_factory(vec![vec![]]);

        let mut supervisor = Supervisor::new(ctx, factory, HEALTH_CHECK_INTERVAL);
        supervisor.start().await.unwrap();

        supervisor.tick().await.unwrap();
        wait_until(|| api.manifest_fetches() == 1).await;
        // No restart happened.
        assert_eq!(created.load(Ordering::SeqCst), 1);

        supervisor.stop();
    }

    // ── URL validation ──────────────────────────────────────────────

    #[test]
    fn service_url_requires_https_except_loopback() {
        assert!(validate_service_url("https://svc.example.com").is_ok());
        assert!(validate_service_url("http://localhost:8080").is_ok());
        assert!(validate_service_url("http://127.0.0.1:8080").is_ok());
        assert!(validate_service_url("http://svc.example.com").is_err());
        assert!(validate_service_url("not a url").is_err());
    }

    #[test]
    fn feed_url_requires_wss_except_loopback() {
        assert!(validate_feed_url("wss://feed.example.com/v1/ws").is_ok());
        assert!(validate_feed_url("ws://localhost:9000").is_ok());
        assert!(validate_feed_url("ws://feed.example.com").is_err());
        assert!(validate_feed_url("https://feed.example.com").is_err());
    }

    #[tokio::test]
    async fn first_tick_starts_a_listener_when_none_runs() {
        let TestContext { ctx, vault: _vault, .. } = test_context();
        let (factory, created) = scripted_factory(vec![vec![]]);

        let mut supervisor = Supervisor::new(ctx, factory, HEALTH_CHECK_INTERVAL);
        assert_eq!(supervisor.listener_status(), None);

        supervisor.tick().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.listener_status(), Some(ChannelStatus::Subscribed));

        supervisor.stop();
    }
}
