//! Provider side orchestration.
//!
//! A [`Provider`] hosts one invoker on a set of servers and keeps a record
//! of every server in every registry for as long as it runs.

use crate::config::ProviderConfig;
use crate::invoker::{FunctionDescriptor, Interceptor, Invoker, Message};
use crate::metadata::CallContext;
use crate::registry::{Registry, Service};
use crate::server::Server;
use crate::{DodoError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Options for [`Provider::new`].
#[derive(Clone)]
pub struct ProviderOptions {
    /// Publish the invoker under this name instead of its own.
    pub name: Option<String>,
    pub version: String,
    pub labels: BTreeMap<String, String>,
    pub servers: Vec<Arc<dyn Server>>,
    pub registries: Vec<Arc<dyn Registry>>,
    pub register_ttl: Duration,
    /// Re-registration period. Zero registers once.
    pub register_interval: Duration,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            name: None,
            version: ProviderConfig::DEFAULT_VERSION.to_string(),
            labels: BTreeMap::new(),
            servers: Vec::new(),
            registries: Vec::new(),
            register_ttl: ProviderConfig::REGISTER_TTL,
            register_interval: ProviderConfig::REGISTER_INTERVAL,
        }
    }
}

impl ProviderOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_server(mut self, server: Arc<dyn Server>) -> Self {
        self.servers.push(server);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registries.push(registry);
        self
    }

    pub fn with_register_ttl(mut self, ttl: Duration) -> Self {
        self.register_ttl = ttl;
        self
    }

    pub fn with_register_interval(mut self, interval: Duration) -> Self {
        self.register_interval = interval;
        self
    }
}

/// An invoker exposed under another name.
struct Renamed {
    name: String,
    inner: Arc<dyn Invoker>,
}

#[async_trait]
impl Invoker for Renamed {
    fn name(&self) -> &str {
        &self.name
    }

    fn functions(&self) -> Vec<FunctionDescriptor> {
        self.inner.functions()
    }

    fn function(&self, name: &str) -> Result<FunctionDescriptor> {
        self.inner.function(name).map_err(|e| match e {
            DodoError::FunctionNotFound { func, .. } => DodoError::FunctionNotFound {
                service: self.name.clone(),
                func,
            },
            other => other,
        })
    }

    fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        self.inner.interceptors()
    }

    async fn invoke(
        &self,
        ctx: CallContext,
        msg: Message,
        interceptors: &[Arc<dyn Interceptor>],
    ) -> Result<Message> {
        self.inner.invoke(ctx, msg, interceptors).await
    }
}

pub struct Provider {
    invoker: Arc<dyn Invoker>,
    options: ProviderOptions,
}

impl Provider {
    pub fn new(invoker: Arc<dyn Invoker>, options: ProviderOptions) -> Self {
        let invoker = match &options.name {
            Some(name) if name != invoker.name() => Arc::new(Renamed {
                name: name.clone(),
                inner: invoker,
            }) as Arc<dyn Invoker>,
            _ => invoker,
        };
        Self { invoker, options }
    }

    /// Name the service is published under.
    pub fn name(&self) -> &str {
        self.invoker.name()
    }

    pub fn options(&self) -> &ProviderOptions {
        &self.options
    }

    /// One record per server.
    ///
    /// A server without an advertised address (not started, no explicit
    /// advertise address) is a configuration error.
    pub async fn services(&self) -> Result<Vec<Service>> {
        let funcs: Vec<String> = self
            .invoker
            .functions()
            .into_iter()
            .map(|f| f.name)
            .collect();
        let timestamp = Utc::now().timestamp();

        let mut services = Vec::with_capacity(self.options.servers.len());
        for server in &self.options.servers {
            let address = server
                .advertised_address()
                .await
                .ok_or_else(|| DodoError::Config {
                    message: format!(
                        "{} server for {} has no address to advertise",
                        server.name(),
                        self.name()
                    ),
                })?;

            let mut codecs: Vec<String> = Vec::new();
            for codec in server.codec_names() {
                if !codecs.contains(&codec) {
                    codecs.push(codec);
                }
            }

            services.push(Service {
                protocol: server.name().to_string(),
                address,
                name: self.name().to_string(),
                version: self.options.version.clone(),
                funcs: funcs.clone(),
                codecs,
                transport: server.transport_name().to_string(),
                side: ProviderConfig::SIDE.to_string(),
                tls: server.tls_enabled(),
                timestamp,
                labels: self.options.labels.clone(),
            });
        }
        Ok(services)
    }

    /// Serve and stay registered until `shutdown` is cancelled.
    ///
    /// If setup fails, servers this call already started are stopped again
    /// before the error is returned.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut started: Vec<&Arc<dyn Server>> = Vec::with_capacity(self.options.servers.len());
        let setup = async {
            for server in &self.options.servers {
                server.start().await?;
                started.push(server);
                server.register(self.invoker.clone()).await?;
            }
            let services = self.services().await?;
            self.register(&services).await?;
            Ok::<_, DodoError>(services)
        }
        .await;
        let services = match setup {
            Ok(services) => services,
            Err(e) => {
                error!("Provider {} failed to start: {}", self.name(), e);
                self.stop_servers(&started).await;
                return Err(e);
            }
        };
        info!(
            "Provider {} serving {} instance(s)",
            self.name(),
            services.len()
        );

        let interval = self.options.register_interval;
        if interval.is_zero() {
            shutdown.cancelled().await;
        } else {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.register(&services).await {
                            error!("Failed to refresh registration of {}: {}", self.name(), e);
                        }
                    }
                }
            }
        }

        info!("Provider {} shutting down", self.name());
        let deregistered = self.deregister(&services).await;
        let servers: Vec<&Arc<dyn Server>> = self.options.servers.iter().collect();
        let stopped = self.stop_servers(&servers).await;
        deregistered.and(stopped)
    }

    /// Stop every server, returning the last failure.
    async fn stop_servers(&self, servers: &[&Arc<dyn Server>]) -> Result<()> {
        let mut stopped = Ok(());
        for server in servers {
            if let Err(e) = server.stop().await {
                warn!("Failed to stop {} server: {}", server.name(), e);
                stopped = Err(e);
            }
        }
        stopped
    }

    async fn register(&self, services: &[Service]) -> Result<()> {
        for registry in &self.options.registries {
            for service in services {
                registry.register(service, self.options.register_ttl).await?;
            }
        }
        Ok(())
    }

    async fn deregister(&self, services: &[Service]) -> Result<()> {
        for registry in &self.options.registries {
            for service in services {
                registry.deregister(service).await?;
            }
        }
        Ok(())
    }
}
