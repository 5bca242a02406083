//! Consumer side orchestration.
//!
//! A [`Consumer`] turns "call function F of service S" into a network call:
//! pick an instance through the selector, find a client that speaks its
//! protocol, agree on a codec, then run the call as the terminal stage of
//! the interceptor chain of the service's invoker.

use crate::client::{CallOptions, Client, RpcClient};
use crate::config::ClientConfig;
use crate::invoker::{Interceptor, InvokerManager, Message, Next};
use crate::metadata::CallContext;
use crate::registry::{Registry, Service};
use crate::selector::filter::{self, compatible, Filter};
use crate::selector::strategy;
use crate::selector::{CacheSelector, CacheSelectorOptions, SelectOptions, Selector, Strategy};
use crate::transport::tls;
use crate::{DodoError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Options for [`Consumer::new`].
#[derive(Default)]
pub struct ConsumerOptions {
    registry: Option<Arc<dyn Registry>>,
    selector: Option<Arc<dyn Selector>>,
    selector_options: CacheSelectorOptions,
    clients: Vec<Arc<dyn Client>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl ConsumerOptions {
    /// Discover instances through `registry` with a [`CacheSelector`].
    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use this selector instead of building a cache selector.
    pub fn with_selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_selector_options(mut self, options: CacheSelectorOptions) -> Self {
        self.selector_options = options;
        self
    }

    /// Add a client. The first one added is also used for address overrides.
    pub fn with_client(mut self, client: Arc<dyn Client>) -> Self {
        self.clients.push(client);
        self
    }

    /// Interceptor run on every call, inside the call-scoped ones.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }
}

/// Options for one [`Consumer::call`].
#[derive(Clone, Default)]
pub struct ConsumerCallOptions {
    /// Skip discovery and dial this address.
    pub address: Option<String>,
    /// Only TLS instances, dialed with this configuration.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub codec: Option<String>,
    pub interceptors: Vec<Arc<dyn Interceptor>>,
    pub filters: Vec<Filter>,
    pub strategy: Option<Strategy>,
}

impl ConsumerCallOptions {
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = Some(codec.into());
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push(filter::filter_label(key, value));
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.filters.push(filter::filter_version(version));
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

impl std::fmt::Debug for ConsumerCallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerCallOptions")
            .field("address", &self.address)
            .field("tls", &self.tls.is_some())
            .field("codec", &self.codec)
            .field("interceptors", &self.interceptors.len())
            .field("filters", &self.filters.len())
            .finish()
    }
}

/// Where and how one call goes out.
struct Route {
    client: Arc<dyn Client>,
    instance: Option<Service>,
    address: String,
    options: CallOptions,
}

/// Terminal interceptor performing the network call.
struct NetworkStage {
    client: Arc<dyn Client>,
    address: String,
    service: String,
    options: CallOptions,
}

#[async_trait]
impl Interceptor for NetworkStage {
    async fn intercept(&self, ctx: CallContext, msg: Message, _next: Next<'_>) -> Result<Message> {
        let payload = self
            .client
            .call(
                &ctx,
                &self.address,
                &self.service,
                &msg.func_name,
                msg.payload,
                &self.options,
            )
            .await?;
        Ok(Message {
            payload,
            error: None,
            ..msg
        })
    }
}

pub struct Consumer {
    selector: Option<Arc<dyn Selector>>,
    clients: Vec<Arc<dyn Client>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    invokers: InvokerManager,
}

impl Consumer {
    pub fn new(options: ConsumerOptions) -> Self {
        let ConsumerOptions {
            registry,
            selector,
            selector_options,
            mut clients,
            interceptors,
        } = options;

        let selector = selector.or_else(|| {
            registry.map(|registry| {
                Arc::new(CacheSelector::new(registry, selector_options)) as Arc<dyn Selector>
            })
        });
        if clients.is_empty() {
            clients.push(Arc::new(RpcClient::default()));
        }

        Self {
            selector,
            clients,
            interceptors,
            invokers: InvokerManager::new(),
        }
    }

    /// Invokers whose interceptors wrap calls to the service of the same name.
    pub fn invokers(&self) -> &InvokerManager {
        &self.invokers
    }

    pub async fn init(&self) -> Result<()> {
        if let Some(selector) = &self.selector {
            selector.init().await?;
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        if let Some(selector) = &self.selector {
            selector.close().await?;
        }
        Ok(())
    }

    /// Call `service.func` with typed request and response.
    pub async fn call<Req, Resp>(
        &self,
        ctx: &CallContext,
        service: &str,
        func: &str,
        request: &Req,
        opts: &ConsumerCallOptions,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let request = serde_json::to_value(request)?;
        let response = self.call_value(ctx, service, func, request, opts).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Call `service.func` with a codec-neutral payload.
    pub async fn call_value(
        &self,
        ctx: &CallContext,
        service: &str,
        func: &str,
        request: Value,
        opts: &ConsumerCallOptions,
    ) -> Result<Value> {
        let route = self.route(service, opts).await?;
        debug!("Calling {}.{} at {}", service, func, route.address);

        let mut chain = opts.interceptors.clone();
        chain.extend(self.interceptors.iter().cloned());
        chain.push(Arc::new(NetworkStage {
            client: route.client,
            address: route.address,
            service: service.to_string(),
            options: route.options,
        }));

        let invoker = self.invokers.get_or_default(service).await;
        let result = invoker
            .invoke(ctx.clone(), Message::new(func, request), &chain)
            .await;

        if let (Some(selector), Some(instance)) = (&self.selector, &route.instance) {
            selector.mark(service, instance, result.as_ref().err());
        }

        let reply = result?;
        match reply.error {
            Some(message) => Err(DodoError::Remote { message }),
            None => Ok(reply.payload),
        }
    }

    async fn route(&self, service: &str, opts: &ConsumerCallOptions) -> Result<Route> {
        if let Some(address) = &opts.address {
            let client = self
                .clients
                .first()
                .cloned()
                .ok_or_else(|| DodoError::ClientNotFound("default".into()))?;
            let codec = opts
                .codec
                .clone()
                .unwrap_or_else(|| ClientConfig::DEFAULT_CODEC.to_string());
            return Ok(Route {
                client,
                instance: None,
                address: address.clone(),
                options: CallOptions {
                    codec: Some(codec),
                    tls: opts.tls.clone(),
                },
            });
        }

        let selector = self.selector.as_ref().ok_or_else(|| DodoError::Config {
            message: format!("no selector configured to discover {}", service),
        })?;

        let mut filters = opts.filters.clone();
        if opts.tls.is_some() {
            filters.push(filter::filter_tls());
        }
        filters.push(filter::filter_client(self.clients.clone()));
        let select = SelectOptions {
            filters,
            strategy: opts.strategy.clone().unwrap_or_else(strategy::random),
        };

        let instance = selector.select(service, &select).await?;
        let client = self
            .clients
            .iter()
            .find(|c| compatible(c.as_ref(), &instance))
            .cloned()
            .ok_or_else(|| DodoError::ClientNotFound(instance.protocol.clone()))?;

        let codec = negotiate_codec(&client.codec_names(), &instance.codecs, opts.codec.as_deref())?;
        let tls = if instance.tls {
            match &opts.tls {
                Some(config) => Some(config.clone()),
                None => Some(tls::insecure_client_config()?),
            }
        } else {
            None
        };

        Ok(Route {
            client,
            address: instance.address.clone(),
            instance: Some(instance),
            options: CallOptions {
                codec: Some(codec),
                tls,
            },
        })
    }
}

/// First codec in the service's order that the client also supports.
///
/// A requested codec must be supported by both sides.
fn negotiate_codec(client: &[String], service: &[String], requested: Option<&str>) -> Result<String> {
    let mut shared = service.iter().filter(|codec| client.contains(codec));
    let chosen = match requested {
        Some(name) => shared.find(|codec| codec.as_str() == name),
        None => shared.next(),
    };
    chosen.cloned().ok_or_else(|| DodoError::NoCompatibleCodec {
        client: client.join(","),
        service: service.join(","),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::testing::recorder;
    use std::sync::Mutex;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_negotiate_prefers_service_order() {
        let chosen = negotiate_codec(
            &names(&["json", "msgpack"]),
            &names(&["msgpack", "json"]),
            None,
        )
        .unwrap();
        assert_eq!(chosen, "msgpack");
    }

    #[test]
    fn test_negotiate_empty_intersection() {
        let err = negotiate_codec(&names(&["json"]), &names(&["msgpack"]), None).unwrap_err();
        assert!(matches!(err, DodoError::NoCompatibleCodec { .. }));

        let err =
            negotiate_codec(&names(&["json"]), &names(&["json"]), Some("msgpack")).unwrap_err();
        assert!(matches!(err, DodoError::NoCompatibleCodec { .. }));
    }

    /// Client answering every call with `<request> via <address>`.
    struct FakeClient {
        seen: Mutex<Vec<(String, CallOptions)>>,
    }

    #[async_trait]
    impl Client for FakeClient {
        fn protocol(&self) -> &str {
            "rpc"
        }

        fn transport_name(&self) -> &str {
            "tcp"
        }

        fn codec_names(&self) -> Vec<String> {
            names(&["json", "msgpack"])
        }

        async fn call(
            &self,
            _ctx: &CallContext,
            address: &str,
            _service: &str,
            _func: &str,
            request: Value,
            opts: &CallOptions,
        ) -> Result<Value> {
            self.seen
                .lock()
                .unwrap()
                .push((address.to_string(), opts.clone()));
            let text = request.as_str().unwrap_or_default();
            Ok(Value::String(format!("{} via {}", text, address)))
        }
    }

    struct FixedSelector(Vec<Service>);

    #[async_trait]
    impl Selector for FixedSelector {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn init(&self) -> Result<()> {
            Ok(())
        }

        async fn select(&self, service: &str, opts: &SelectOptions) -> Result<Service> {
            crate::selector::pick(service, self.0.clone(), opts)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn instance(address: &str, tls: bool, codecs: &[&str]) -> Service {
        Service {
            protocol: "rpc".into(),
            address: address.into(),
            name: "Hello".into(),
            version: "0.1.0".into(),
            funcs: names(&["SayHello"]),
            codecs: names(codecs),
            transport: "tcp".into(),
            side: "provider".into(),
            tls,
            timestamp: 1,
            ..Service::default()
        }
    }

    fn consumer(instances: Vec<Service>) -> (Consumer, Arc<FakeClient>) {
        let client = Arc::new(FakeClient {
            seen: Mutex::new(Vec::new()),
        });
        let consumer = Consumer::new(
            ConsumerOptions::default()
                .with_selector(Arc::new(FixedSelector(instances)))
                .with_client(client.clone()),
        );
        (consumer, client)
    }

    #[tokio::test]
    async fn test_call_through_selected_instance() {
        let (consumer, client) = consumer(vec![instance("10.0.0.1:1", false, &["msgpack", "json"])]);
        let reply: String = consumer
            .call(
                &CallContext::new(),
                "Hello",
                "SayHello",
                "hi",
                &ConsumerCallOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(reply, "hi via 10.0.0.1:1");

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].1.codec.as_deref(), Some("msgpack"));
        assert!(seen[0].1.tls.is_none());
    }

    #[tokio::test]
    async fn test_tls_instance_dials_tls_without_config() {
        let (consumer, client) = consumer(vec![instance("10.0.0.2:1", true, &["json"])]);
        let _: String = consumer
            .call(
                &CallContext::new(),
                "Hello",
                "SayHello",
                "hi",
                &ConsumerCallOptions::default(),
            )
            .await
            .unwrap();
        assert!(client.seen.lock().unwrap()[0].1.tls.is_some());
    }

    #[tokio::test]
    async fn test_address_override_skips_discovery() {
        let (consumer, client) = consumer(Vec::new());
        let opts = ConsumerCallOptions::default().with_address("127.0.0.1:9");
        let reply: String = consumer
            .call(&CallContext::new(), "Hello", "SayHello", "hi", &opts)
            .await
            .unwrap();
        assert_eq!(reply, "hi via 127.0.0.1:9");
        assert_eq!(
            client.seen.lock().unwrap()[0].1.codec.as_deref(),
            Some("json")
        );
    }

    #[tokio::test]
    async fn test_no_instances_and_filtered_out() {
        let (consumer, _) = consumer(vec![instance("10.0.0.1:1", false, &["json"])]);
        let err = consumer
            .call_value(
                &CallContext::new(),
                "Other",
                "SayHello",
                Value::Null,
                &ConsumerCallOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DodoError::NoneAvailable(name) if name == "Other"));

        let opts = ConsumerCallOptions::default().with_version("2.0.0");
        let err = consumer
            .call_value(&CallContext::new(), "Hello", "SayHello", Value::Null, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, DodoError::NoneAvailable(_)));
    }

    #[tokio::test]
    async fn test_interceptor_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let client = Arc::new(FakeClient {
            seen: Mutex::new(Vec::new()),
        });
        let consumer = Consumer::new(
            ConsumerOptions::default()
                .with_selector(Arc::new(FixedSelector(vec![instance(
                    "10.0.0.1:1",
                    false,
                    &["json"],
                )])))
                .with_client(client)
                .with_interceptor(recorder("consumer", &log)),
        );
        let opts = ConsumerCallOptions::default().with_interceptor(recorder("call", &log));
        let _: String = consumer
            .call(&CallContext::new(), "Hello", "SayHello", "hi", &opts)
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["enter call", "enter consumer", "exit consumer", "exit call"]
        );
    }

    struct Failing;

    #[async_trait]
    impl Interceptor for Failing {
        async fn intercept(&self, _ctx: CallContext, _msg: Message, _next: Next<'_>) -> Result<Message> {
            Err(DodoError::Remote {
                message: "denied".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_interceptor_error_reaches_caller() {
        let (consumer, client) = consumer(vec![instance("10.0.0.1:1", false, &["json"])]);
        let opts = ConsumerCallOptions::default().with_interceptor(Arc::new(Failing));
        let err = consumer
            .call_value(&CallContext::new(), "Hello", "SayHello", Value::Null, &opts)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "denied");
        assert!(client.seen.lock().unwrap().is_empty());
    }
}
