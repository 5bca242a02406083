//! End-to-end tests of the RPC client and server over real TCP.

use async_trait::async_trait;
use dodo_core::client::{self, CallOptions, PoolOptions};
use dodo_core::codec::{Codec, Codecs, JsonCodec, MsgpackCodec};
use dodo_core::config::TransportConfig;
use dodo_core::transport::{
    tls, Accepted, Connection, DialOptions, ListenOptions, Listener, TcpTransport, Transport,
};
use dodo_core::{
    CallContext, DodoError, FunctionInvoker, ReceiverInvoker, RpcClient, RpcClientOptions,
    RpcServer, RpcServerOptions, Server,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts listens, listener closes and dials going through TCP.
#[derive(Default)]
struct CountingTransport {
    listens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    dials: AtomicUsize,
}

struct CountingListener {
    inner: Box<dyn Listener>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Listener for CountingListener {
    async fn accept(&mut self) -> dodo_core::Result<Accepted> {
        self.inner.accept().await
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    async fn close(&mut self) -> dodo_core::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}

#[async_trait]
impl Transport for CountingTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn dial(
        &self,
        address: &str,
        opts: &DialOptions,
    ) -> dodo_core::Result<Box<dyn Connection>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        TcpTransport.dial(address, opts).await
    }

    async fn listen(
        &self,
        address: &str,
        opts: &ListenOptions,
    ) -> dodo_core::Result<Box<dyn Listener>> {
        self.listens.fetch_add(1, Ordering::SeqCst);
        let inner = TcpTransport.listen(address, opts).await?;
        Ok(Box::new(CountingListener {
            inner,
            closes: self.closes.clone(),
        }))
    }
}

fn hello_invoker() -> Arc<FunctionInvoker> {
    Arc::new(
        FunctionInvoker::new("SayHello", |_ctx: CallContext, name: String| async move {
            match name.as_str() {
                "panic" => panic!("handler exploded"),
                "huge" => Ok::<_, String>("x".repeat(TransportConfig::MAX_FRAME_SIZE)),
                _ => Ok(format!("{} dodo", name)),
            }
        })
        .with_name("Hello"),
    )
}

async fn start_server(options: RpcServerOptions) -> (RpcServer, String) {
    let server = RpcServer::new(options.with_address("127.0.0.1:0"));
    server.register(hello_invoker()).await.unwrap();
    server.start().await.unwrap();
    let address = server.advertised_address().await.unwrap();
    (server, address)
}

#[tokio::test]
async fn test_say_hello() {
    let (server, address) = start_server(RpcServerOptions::default()).await;
    let client = RpcClient::default();

    let reply: String = client::call(
        &client,
        &CallContext::new(),
        &address,
        "Hello",
        "SayHello",
        "hello",
        &CallOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(reply, "hello dodo");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_service_names_it() {
    let (server, address) = start_server(RpcServerOptions::default()).await;
    let client = RpcClient::default();

    let err = client::call::<_, String>(
        &client,
        &CallContext::new(),
        &address,
        "Goodbye",
        "SayHello",
        "hello",
        &CallOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(&err, DodoError::Remote { .. }));
    assert!(err.to_string().contains("Goodbye"));

    let err = client::call::<_, String>(
        &client,
        &CallContext::new(),
        &address,
        "Hello",
        "SayBye",
        "hello",
        &CallOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("SayBye"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_panic_is_contained_and_connection_reused() {
    let (server, address) = start_server(RpcServerOptions::default()).await;
    let transport = Arc::new(CountingTransport::default());
    let client = RpcClient::new(RpcClientOptions::default().with_transport(transport.clone()));

    let err = client::call::<_, String>(
        &client,
        &CallContext::new(),
        &address,
        "Hello",
        "SayHello",
        "panic",
        &CallOptions::default(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.to_string(), "Internal Server Error");

    let reply: String = client::call(
        &client,
        &CallContext::new(),
        &address,
        "Hello",
        "SayHello",
        "still here",
        &CallOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(reply, "still here dodo");
    assert_eq!(transport.dials.load(Ordering::SeqCst), 1);
    assert_eq!(client.pool().idle_count(&address).await, 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_oversized_reply_keeps_connection_serving() {
    let (server, address) = start_server(RpcServerOptions::default()).await;
    let transport = Arc::new(CountingTransport::default());
    let client = RpcClient::new(RpcClientOptions::default().with_transport(transport.clone()));

    let err = client::call::<_, String>(
        &client,
        &CallContext::new(),
        &address,
        "Hello",
        "SayHello",
        "huge",
        &CallOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(&err, DodoError::Remote { .. }));
    assert!(err.to_string().contains("exceeds maximum"));

    let reply: String = client::call(
        &client,
        &CallContext::new(),
        &address,
        "Hello",
        "SayHello",
        "after",
        &CallOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(reply, "after dodo");
    assert_eq!(transport.dials.load(Ordering::SeqCst), 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_connectivity_failure_is_not_pooled() {
    let (server, address) = start_server(RpcServerOptions::default()).await;
    let transport = Arc::new(CountingTransport::default());
    let client = RpcClient::new(
        RpcClientOptions::default()
            .with_transport(transport.clone())
            .with_pool(PoolOptions::default().with_size(2)),
    );

    let _: String = client::call(
        &client,
        &CallContext::new(),
        &address,
        "Hello",
        "SayHello",
        "a",
        &CallOptions::default(),
    )
    .await
    .unwrap();
    server.stop().await.unwrap();

    let result = client::call::<_, String>(
        &client,
        &CallContext::new(),
        &address,
        "Hello",
        "SayHello",
        "b",
        &CallOptions::default(),
    )
    .await;
    assert!(result.unwrap_err().is_connectivity());
    assert_eq!(client.pool().idle_count(&address).await, 0);
}

#[tokio::test]
async fn test_lifecycle_is_reference_counted() {
    let transport = Arc::new(CountingTransport::default());
    let server = RpcServer::new(
        RpcServerOptions::default()
            .with_address("127.0.0.1:0")
            .with_transport(transport.clone()),
    );

    for _ in 0..3 {
        server.start().await.unwrap();
    }
    for _ in 0..3 {
        server.stop().await.unwrap();
    }
    assert_eq!(transport.listens.load(Ordering::SeqCst), 1);
    assert_eq!(transport.closes.load(Ordering::SeqCst), 1);

    server.stop().await.unwrap();
    server.start().await.unwrap();
    assert_eq!(transport.listens.load(Ordering::SeqCst), 1);
    assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    assert!(server.advertised_address().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lifecycle_opens_and_closes_once() {
    let transport = Arc::new(CountingTransport::default());
    let server = Arc::new(RpcServer::new(
        RpcServerOptions::default()
            .with_address("127.0.0.1:0")
            .with_transport(transport.clone()),
    ));

    let starts = (0..32).map(|_| {
        let server = server.clone();
        tokio::spawn(async move { server.start().await })
    });
    for result in join_all(starts).await {
        result.unwrap().unwrap();
    }
    let address = server.advertised_address().await.unwrap();
    assert_eq!(transport.listens.load(Ordering::SeqCst), 1);

    let stops = (0..40).map(|_| {
        let server = server.clone();
        tokio::spawn(async move { server.stop().await })
    });
    for result in join_all(stops).await {
        result.unwrap().unwrap();
    }
    assert_eq!(transport.listens.load(Ordering::SeqCst), 1);
    assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    assert!(server.advertised_address().await.is_none());
    assert!(tokio::net::TcpStream::connect(&address).await.is_err());
}

#[tokio::test]
async fn test_metadata_and_msgpack() {
    #[derive(Serialize, Deserialize)]
    struct Greeting {
        name: String,
        times: u32,
    }

    struct Greeter {
        prefix: String,
    }

    let invoker = ReceiverInvoker::new(Greeter {
        prefix: "hi".into(),
    })
    .with_name("Greeter")
    .method("Greet", |greeter: Arc<Greeter>, ctx: CallContext, req: Greeting| async move {
        let user = ctx.get("user").unwrap_or("anonymous").to_string();
        Ok::<_, String>(format!(
            "{} {} x{} from {}",
            greeter.prefix, req.name, req.times, user
        ))
    });

    let codecs = Codecs::from_list([
        Arc::new(JsonCodec) as Arc<dyn Codec>,
        Arc::new(MsgpackCodec) as Arc<dyn Codec>,
    ]);
    let server = RpcServer::new(
        RpcServerOptions::default()
            .with_address("127.0.0.1:0")
            .with_codecs(codecs.clone()),
    );
    server.register(Arc::new(invoker)).await.unwrap();
    server.start().await.unwrap();
    let address = server.advertised_address().await.unwrap();

    let client = RpcClient::new(RpcClientOptions::default().with_codecs(codecs));
    let ctx = CallContext::new().with("user", "ada");
    let reply: String = client::call(
        &client,
        &ctx,
        &address,
        "Greeter",
        "Greet",
        &Greeting {
            name: "dodo".into(),
            times: 2,
        },
        &CallOptions::default().with_codec("msgpack"),
    )
    .await
    .unwrap();
    assert_eq!(reply, "hi dodo x2 from ada");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_tls_round_trip() {
    let (server, address) = start_server(RpcServerOptions::default().with_tls(true)).await;
    assert!(server.tls_enabled());

    let client = RpcClient::default();
    let opts = CallOptions::default().with_tls(tls::insecure_client_config().unwrap());
    let reply: String = client::call(
        &client,
        &CallContext::new(),
        &address,
        "Hello",
        "SayHello",
        "secure",
        &opts,
    )
    .await
    .unwrap();
    assert_eq!(reply, "secure dodo");

    server.stop().await.unwrap();
}
