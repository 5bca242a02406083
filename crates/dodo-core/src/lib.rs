//! Dodo Core - RPC framework with registry based service discovery.
//!
//! Providers host invokers on reference-counted servers and publish one
//! service record per server into a registry. Consumers discover instances
//! through a caching selector, negotiate a codec and call over a pooled
//! framed TCP (optionally TLS) transport.
//!
//! # Example
//!
//! ```rust,ignore
//! use dodo_core::{
//!     CallContext, Consumer, ConsumerCallOptions, ConsumerOptions, FunctionInvoker, Provider,
//!     ProviderOptions, RpcServer, RpcServerOptions, SqliteRegistry,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> dodo_core::Result<()> {
//!     let registry = Arc::new(SqliteRegistry::open_at("registry.db".as_ref())?);
//!
//!     let hello = FunctionInvoker::new("SayHello", |_ctx, name: String| async move {
//!         Ok::<_, String>(format!("{} dodo", name))
//!     })
//!     .with_name("Hello");
//!     let provider = Provider::new(
//!         Arc::new(hello),
//!         ProviderOptions::default()
//!             .with_server(Arc::new(RpcServer::new(RpcServerOptions::default())))
//!             .with_registry(registry.clone()),
//!     );
//!     let shutdown = CancellationToken::new();
//!     tokio::spawn(async move { provider.run(shutdown).await });
//!
//!     let consumer = Consumer::new(ConsumerOptions::default().with_registry(registry));
//!     consumer.init().await?;
//!     let reply: String = consumer
//!         .call(&CallContext::new(), "Hello", "SayHello", "hello", &ConsumerCallOptions::default())
//!         .await?;
//!     assert_eq!(reply, "hello dodo");
//!     consumer.close().await
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod invoker;
pub mod metadata;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod selector;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use backoff::BackoffConfig;
pub use client::{Client, RpcClient, RpcClientOptions};
pub use codec::{Codec, Codecs, JsonCodec, MsgpackCodec};
pub use consumer::{Consumer, ConsumerCallOptions, ConsumerOptions};
pub use error::{DodoError, Result};
pub use invoker::{FunctionInvoker, Interceptor, Invoker, Message, Next, ReceiverInvoker};
pub use metadata::CallContext;
pub use provider::{Provider, ProviderOptions};
pub use registry::{Registry, Service, SqliteRegistry};
pub use selector::{CacheSelector, CacheSelectorOptions, SelectOptions, Selector, SimpleSelector};
pub use server::{RpcServer, RpcServerOptions, Server};
pub use transport::{TcpTransport, Transport};
