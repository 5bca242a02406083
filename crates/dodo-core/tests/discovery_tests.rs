//! Service discovery: selector recovery, snapshot fallback and full
//! provider to consumer calls through a registry.

use async_trait::async_trait;
use dodo_core::registry::{WatchEvent, Watcher};
use dodo_core::selector::snapshot::write_snapshot;
use dodo_core::{
    BackoffConfig, CacheSelector, CacheSelectorOptions, CallContext, Consumer,
    ConsumerCallOptions, ConsumerOptions, DodoError, FunctionInvoker, Provider, ProviderOptions,
    Registry, RpcServer, RpcServerOptions, SelectOptions, Selector, Service, SqliteRegistry,
};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Opt into log output with `RUST_LOG=dodo_core=debug`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn record(name: &str, address: &str) -> Service {
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

fn selector_options(tmp: &TempDir) -> CacheSelectorOptions {
    CacheSelectorOptions::default()
        .with_cache_dir(tmp.path().join("cache"))
        .with_config_dir(tmp.path().join("config"))
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Registry whose first watcher fails and second panics.
struct FlakyRegistry {
    inner: SqliteRegistry,
    watches: AtomicUsize,
}

struct FailingWatcher;

#[async_trait]
impl Watcher for FailingWatcher {
    async fn next(&mut self) -> dodo_core::Result<WatchEvent> {
        Err(DodoError::registry("stream reset"))
    }

    fn stop(&mut self) {}
}

struct PanickingWatcher;

#[async_trait]
impl Watcher for PanickingWatcher {
    async fn next(&mut self) -> dodo_core::Result<WatchEvent> {
        panic!("watch decoder bug");
    }

    fn stop(&mut self) {}
}

#[async_trait]
impl Registry for FlakyRegistry {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn register(&self, service: &Service, ttl: Duration) -> dodo_core::Result<()> {
        self.inner.register(service, ttl).await
    }

    async fn deregister(&self, service: &Service) -> dodo_core::Result<()> {
        self.inner.deregister(service).await
    }

    async fn get_service(&self, name: &str) -> dodo_core::Result<Vec<Service>> {
        self.inner.get_service(name).await
    }

    async fn list_services(&self) -> dodo_core::Result<Vec<Service>> {
        self.inner.list_services().await
    }

    async fn watch(&self) -> dodo_core::Result<Box<dyn Watcher>> {
        let watcher: Box<dyn Watcher> = match self.watches.load(Ordering::SeqCst) {
            0 => Box::new(FailingWatcher),
            1 => Box::new(PanickingWatcher),
            _ => self.inner.watch().await?,
        };
        self.watches.fetch_add(1, Ordering::SeqCst);
        Ok(watcher)
    }
}

/// Registry that cannot be reached.
struct DownRegistry;

#[async_trait]
impl Registry for DownRegistry {
    fn name(&self) -> &str {
        "down"
    }

    async fn register(&self, _service: &Service, _ttl: Duration) -> dodo_core::Result<()> {
        Err(DodoError::registry("connection refused"))
    }

    async fn deregister(&self, _service: &Service) -> dodo_core::Result<()> {
        Err(DodoError::registry("connection refused"))
    }

    async fn get_service(&self, _name: &str) -> dodo_core::Result<Vec<Service>> {
        Err(DodoError::registry("connection refused"))
    }

    async fn list_services(&self) -> dodo_core::Result<Vec<Service>> {
        Err(DodoError::registry("connection refused"))
    }

    async fn watch(&self) -> dodo_core::Result<Box<dyn Watcher>> {
        Err(DodoError::registry("connection refused"))
    }
}

#[tokio::test]
async fn test_watch_recovers_and_stops_on_close() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let registry = Arc::new(FlakyRegistry {
        inner: SqliteRegistry::open_in_memory().unwrap(),
        watches: AtomicUsize::new(0),
    });
    let backoff = BackoffConfig::new()
        .with_base_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(50))
        .with_jitter(false);
    let selector = CacheSelector::new(
        registry.clone(),
        selector_options(&tmp)
            .with_refresh_interval(Duration::from_secs(3600))
            .with_backoff(backoff),
    );
    selector.init().await.unwrap();

    assert!(eventually(|| async { registry.watches.load(Ordering::SeqCst) >= 3 }).await);

    registry
        .register(&record("Hello", "127.0.0.1:7001"), Duration::from_secs(60))
        .await
        .unwrap();
    assert!(eventually(|| async { selector.cached("Hello").await.is_some() }).await);
    let picked = selector
        .select("Hello", &SelectOptions::default())
        .await
        .unwrap();
    assert_eq!(picked.address, "127.0.0.1:7001");

    selector.close().await.unwrap();
    let watches = registry.watches.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(registry.watches.load(Ordering::SeqCst), watches);
}

#[tokio::test]
async fn test_init_falls_back_to_snapshots() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    write_snapshot(
        &tmp.path().join("cache"),
        "Hello",
        &[record("Hello", "127.0.0.1:7002")],
    )
    .unwrap();

    let selector = CacheSelector::new(Arc::new(DownRegistry), selector_options(&tmp));
    selector.init().await.unwrap();
    let picked = selector
        .select("Hello", &SelectOptions::default())
        .await
        .unwrap();
    assert_eq!(picked.address, "127.0.0.1:7002");
    selector.close().await.unwrap();
}

#[tokio::test]
async fn test_init_fails_without_registry_or_snapshots() {
    let tmp = TempDir::new().unwrap();
    let selector = CacheSelector::new(Arc::new(DownRegistry), selector_options(&tmp));
    let err = selector.init().await.unwrap_err();
    assert!(err.is_discovery());
}

fn hello() -> Arc<FunctionInvoker> {
    Arc::new(
        FunctionInvoker::new("SayHello", |_ctx: CallContext, name: String| async move {
            Ok::<_, String>(format!("{} dodo", name))
        })
        .with_name("Hello"),
    )
}

async fn serve(
    registry: Arc<SqliteRegistry>,
    server: RpcServerOptions,
) -> (CancellationToken, tokio::task::JoinHandle<dodo_core::Result<()>>) {
    let provider = Provider::new(
        hello(),
        ProviderOptions::default()
            .with_server(Arc::new(RpcServer::new(server.with_address("127.0.0.1:0"))))
            .with_registry(registry.clone()),
    );
    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { provider.run(shutdown).await }
    });
    assert!(
        eventually(|| async { !registry.get_service("Hello").await.unwrap().is_empty() }).await
    );
    (shutdown, task)
}

#[tokio::test]
async fn test_consumer_calls_discovered_provider() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let registry = Arc::new(SqliteRegistry::open_in_memory().unwrap());
    let (shutdown, task) = serve(registry.clone(), RpcServerOptions::default()).await;

    let consumer = Consumer::new(
        ConsumerOptions::default()
            .with_registry(registry.clone())
            .with_selector_options(selector_options(&tmp)),
    );
    consumer.init().await.unwrap();

    let reply: String = consumer
        .call(
            &CallContext::new(),
            "Hello",
            "SayHello",
            "hello",
            &ConsumerCallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply, "hello dodo");

    let err = consumer
        .call::<_, String>(
            &CallContext::new(),
            "Hello",
            "SayHello",
            "hello",
            &ConsumerCallOptions::default().with_version("9.9.9"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DodoError::NoneAvailable(_)));

    consumer.close().await.unwrap();
    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_consumer_reaches_tls_provider() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let registry = Arc::new(SqliteRegistry::open_in_memory().unwrap());
    let (shutdown, task) = serve(registry.clone(), RpcServerOptions::default().with_tls(true)).await;

    let instances = registry.get_service("Hello").await.unwrap();
    assert!(instances[0].tls);

    let consumer = Consumer::new(
        ConsumerOptions::default()
            .with_registry(registry.clone())
            .with_selector_options(selector_options(&tmp)),
    );
    consumer.init().await.unwrap();

    let reply: String = consumer
        .call(
            &CallContext::new(),
            "Hello",
            "SayHello",
            "secure",
            &ConsumerCallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply, "secure dodo");

    consumer.close().await.unwrap();
    shutdown.cancel();
    task.await.unwrap().unwrap();
}
