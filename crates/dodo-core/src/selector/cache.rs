//! Caching selector.
//!
//! The cache is filled once at `init`, from the static config directory if it
//! holds snapshots, otherwise from the registry, falling back to the last
//! snapshots written to the cache directory when the registry is
//! unreachable. Unless the static config was used, two background tasks then
//! keep it current until `close`:
//!
//! * a ticker re-listing every service each refresh interval;
//! * a watch consumer re-reading a single service whenever it changes.
//!
//! The watch consumer is supervised. If the watch stream fails or the
//! consumer panics it is started again after an exponential backoff.

use super::snapshot::{load_dir, remove_snapshot, write_snapshot};
use super::{pick, SelectOptions, Selector};
use crate::backoff::BackoffConfig;
use crate::config::SelectorConfig;
use crate::registry::{Registry, Service};
use crate::{DodoError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Options for [`CacheSelector`].
#[derive(Debug, Clone)]
pub struct CacheSelectorOptions {
    /// Where snapshots are written and read back when the registry is down.
    pub cache_dir: PathBuf,
    /// Static snapshots that, when present, replace the registry entirely.
    pub config_dir: PathBuf,
    pub refresh_interval: Duration,
    /// Restart schedule for the watch consumer.
    pub backoff: BackoffConfig,
}

impl Default for CacheSelectorOptions {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(SelectorConfig::DEFAULT_CACHE_DIR),
            config_dir: PathBuf::from(SelectorConfig::DEFAULT_CONFIG_DIR),
            refresh_interval: SelectorConfig::REFRESH_INTERVAL,
            backoff: BackoffConfig::default(),
        }
    }
}

impl CacheSelectorOptions {
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = dir.into();
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// State shared with the background tasks.
struct Shared {
    registry: Arc<dyn Registry>,
    cache: RwLock<HashMap<String, Vec<Service>>>,
    cache_dir: PathBuf,
}

impl Shared {
    /// Replace the whole cache with a full listing.
    async fn replace_all(&self, services: Vec<Service>) {
        let mut grouped: HashMap<String, Vec<Service>> = HashMap::new();
        for service in services {
            grouped.entry(service.name.clone()).or_default().push(service);
        }

        let removed: Vec<String> = {
            let mut cache = self.cache.write().await;
            let removed = cache
                .keys()
                .filter(|name| !grouped.contains_key(*name))
                .cloned()
                .collect();
            *cache = grouped.clone();
            removed
        };

        for (name, list) in &grouped {
            self.persist(name, list);
        }
        for name in removed {
            self.persist(&name, &[]);
        }
    }

    /// Replace one service's entry. An empty list removes it.
    async fn replace_one(&self, name: &str, services: Vec<Service>) {
        {
            let mut cache = self.cache.write().await;
            if services.is_empty() {
                cache.remove(name);
            } else {
                cache.insert(name.to_string(), services.clone());
            }
        }
        self.persist(name, &services);
    }

    fn persist(&self, name: &str, services: &[Service]) {
        let result = if services.is_empty() {
            remove_snapshot(&self.cache_dir, name)
        } else {
            write_snapshot(&self.cache_dir, name, services)
        };
        if let Err(e) = result {
            warn!("Failed to persist snapshot for {}: {}", name, e);
        }
    }

    async fn refresh_all(&self) -> Result<()> {
        let services = self.registry.list_services().await?;
        debug!("Refreshed {} service record(s)", services.len());
        self.replace_all(services).await;
        Ok(())
    }

    async fn refresh_one(&self, name: &str) {
        match self.registry.get_service(name).await {
            Ok(services) => self.replace_one(name, services).await,
            Err(e) => warn!("Failed to re-read {} after a change: {}", name, e),
        }
    }
}

/// Selector backed by a registry-fed local cache.
pub struct CacheSelector {
    shared: Arc<Shared>,
    options: CacheSelectorOptions,
    initialized: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl CacheSelector {
    pub fn new(registry: Arc<dyn Registry>, options: CacheSelectorOptions) -> Self {
        let shared = Arc::new(Shared {
            registry,
            cache: RwLock::new(HashMap::new()),
            cache_dir: options.cache_dir.clone(),
        });
        Self {
            shared,
            options,
            initialized: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Cached instances of `service`, if any.
    pub async fn cached(&self, service: &str) -> Option<Vec<Service>> {
        self.shared.cache.read().await.get(service).cloned()
    }

    /// Names of every cached service, sorted.
    pub async fn cached_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.cache.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn load_static(&self) -> Option<HashMap<String, Vec<Service>>> {
        match load_dir(&self.options.config_dir) {
            Ok(Some(services)) if !services.is_empty() => Some(services),
            Ok(_) => None,
            Err(e) => {
                warn!(
                    "Ignoring static selector config in {}: {}",
                    self.options.config_dir.display(),
                    e
                );
                None
            }
        }
    }

    async fn load_fallback(&self, cause: DodoError) -> Result<()> {
        warn!(
            "Registry {} unavailable, loading snapshots from {}: {}",
            self.shared.registry.name(),
            self.options.cache_dir.display(),
            cause
        );
        match load_dir(&self.options.cache_dir) {
            Ok(Some(services)) => {
                info!("Loaded {} service(s) from snapshots", services.len());
                *self.shared.cache.write().await = services;
                Ok(())
            }
            Ok(None) => Err(cause),
            Err(e) => {
                warn!("Failed to load snapshots: {}", e);
                Err(cause)
            }
        }
    }

    fn spawn_background(&self) {
        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.options.refresh_interval;
        self.tasks
            .spawn(async move { refresh_loop(shared, interval, shutdown).await });

        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        let backoff = self.options.backoff.clone();
        self.tasks
            .spawn(async move { supervise_watch(shared, backoff, shutdown).await });
    }
}

#[async_trait]
impl Selector for CacheSelector {
    fn name(&self) -> &str {
        "cache"
    }

    async fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(services) = self.load_static() {
            info!(
                "Using static selector config from {} ({} service(s))",
                self.options.config_dir.display(),
                services.len()
            );
            *self.shared.cache.write().await = services;
            return Ok(());
        }

        let loaded = match self.shared.refresh_all().await {
            Ok(()) => Ok(()),
            Err(e) => self.load_fallback(e).await,
        };
        if let Err(e) = loaded {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.spawn_background();
        Ok(())
    }

    async fn select(&self, service: &str, opts: &SelectOptions) -> Result<Service> {
        let candidates = self.cached(service).await.unwrap_or_default();
        pick(service, candidates, opts)
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        debug!("Cache selector closed");
        Ok(())
    }
}

async fn refresh_loop(shared: Arc<Shared>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = shared.refresh_all().await {
                    warn!("Periodic registry refresh failed: {}", e);
                }
            }
        }
    }
}

/// Keep a watch consumer running until shutdown.
async fn supervise_watch(shared: Arc<Shared>, backoff: BackoffConfig, shutdown: CancellationToken) {
    let mut attempt = 0u32;
    loop {
        let started = Instant::now();
        let outcome = tokio::spawn(watch_once(shared.clone(), shutdown.clone())).await;
        if shutdown.is_cancelled() {
            break;
        }

        match outcome {
            Ok(Ok(())) => break,
            Ok(Err(e)) => warn!("Registry watch failed: {}", e),
            Err(e) if e.is_panic() => error!("Registry watch panicked"),
            Err(e) => {
                warn!("Registry watch task cancelled: {}", e);
                break;
            }
        }

        if backoff.recovered(started.elapsed()) {
            attempt = 0;
        }
        let delay = backoff.restart_delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!("Restarting registry watch in {:?}", delay);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn watch_once(shared: Arc<Shared>, shutdown: CancellationToken) -> Result<()> {
    let mut watcher = shared.registry.watch().await?;
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => {
                watcher.stop();
                return Ok(());
            }
            event = watcher.next() => event?,
        };
        debug!("Registry {} for {}", event.action, event.service);
        shared.refresh_one(&event.service.name).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SqliteRegistry;
    use tempfile::TempDir;

    fn service(name: &str, address: &str) -> Service {
        Service {
            protocol: "rpc".into(),
            address: address.into(),
            name: name.into(),
            version: "0.1.0".into(),
            funcs: vec!["SayHello".into()],
            codecs: vec!["json".into()],
            transport: "tcp".into(),
            side: "provider".into(),
            timestamp: 1_700_000_000,
            ..Service::default()
        }
    }

    fn options(tmp: &TempDir) -> CacheSelectorOptions {
        CacheSelectorOptions::default()
            .with_cache_dir(tmp.path().join("cache"))
            .with_config_dir(tmp.path().join("config"))
    }

    #[tokio::test]
    async fn test_init_pulls_and_persists() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(SqliteRegistry::open_in_memory().unwrap());
        registry
            .register(&service("Hello", "127.0.0.1:1"), Duration::from_secs(60))
            .await
            .unwrap();

        let selector = CacheSelector::new(registry, options(&tmp));
        selector.init().await.unwrap();

        let picked = selector.select("Hello", &SelectOptions::default()).await.unwrap();
        assert_eq!(picked.address, "127.0.0.1:1");
        assert!(tmp.path().join("cache").join("Hello.json").exists());
        assert!(matches!(
            selector.select("Missing", &SelectOptions::default()).await,
            Err(DodoError::NoneAvailable(_))
        ));
        selector.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_static_config_wins() {
        let tmp = TempDir::new().unwrap();
        write_snapshot(&tmp.path().join("config"), "Pinned", &[service("Pinned", "10.0.0.9:1")])
            .unwrap();
        let registry = Arc::new(SqliteRegistry::open_in_memory().unwrap());
        registry
            .register(&service("Hello", "127.0.0.1:1"), Duration::from_secs(60))
            .await
            .unwrap();

        let selector = CacheSelector::new(registry, options(&tmp));
        selector.init().await.unwrap();

        assert_eq!(selector.cached_names().await, vec!["Pinned"]);
        selector.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_changes_reach_cache() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(SqliteRegistry::open_in_memory().unwrap());
        let selector = CacheSelector::new(
            registry.clone(),
            options(&tmp).with_refresh_interval(Duration::from_millis(100)),
        );
        selector.init().await.unwrap();

        let svc = service("Hello", "127.0.0.1:1");
        registry.register(&svc, Duration::from_secs(60)).await.unwrap();
        wait_until(|| async { selector.cached("Hello").await.is_some() }).await;

        registry.deregister(&svc).await.unwrap();
        wait_until(|| async { selector.cached("Hello").await.is_none() }).await;
        assert!(!tmp.path().join("cache").join("Hello.json").exists());

        selector.close().await.unwrap();
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }
}
