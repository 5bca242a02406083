//! Client side of a call.
//!
//! A [`Client`] performs one synchronous request/response against a known
//! address. It works on codec-neutral [`serde_json::Value`]s so it can sit
//! behind a trait object; [`call`] adds the typed conversion on top.

mod pool;
mod rpc;

pub use pool::{Pool, PoolOptions, PooledConnection};
pub use rpc::{RpcClient, RpcClientOptions};

use crate::metadata::CallContext;
use crate::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Per-call client options.
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Codec for the request and response bodies. Defaults to `json`.
    pub codec: Option<String>,
    /// Dial over TLS with this configuration.
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl CallOptions {
    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = Some(codec.into());
        self
    }

    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }
}

impl std::fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("codec", &self.codec)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// A protocol adapter able to call a remote function.
#[async_trait]
pub trait Client: Send + Sync + 'static {
    /// Protocol this client speaks, matched against service records.
    fn protocol(&self) -> &str;

    fn transport_name(&self) -> &str;

    /// Codecs this client can encode with, in preference order.
    fn codec_names(&self) -> Vec<String>;

    async fn call(
        &self,
        ctx: &CallContext,
        address: &str,
        service: &str,
        func: &str,
        request: Value,
        opts: &CallOptions,
    ) -> Result<Value>;
}

/// Call a remote function with typed request and response.
pub async fn call<Req, Resp>(
    client: &dyn Client,
    ctx: &CallContext,
    address: &str,
    service: &str,
    func: &str,
    request: &Req,
    opts: &CallOptions,
) -> Result<Resp>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let request = serde_json::to_value(request)?;
    let response = client.call(ctx, address, service, func, request, opts).await?;
    Ok(serde_json::from_value(response)?)
}
