//! The `rpc` protocol client.

use super::pool::{Pool, PoolOptions};
use super::{CallOptions, Client};
use crate::codec::{Codec, Codecs};
use crate::config::{ClientConfig, ServerConfig, TransportConfig};
use crate::metadata::CallContext;
use crate::protocol::{self, Envelope};
use crate::transport::{check_frame, DialOptions, TcpTransport, Transport, WireMessage};
use crate::{DodoError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Options for [`RpcClient`].
#[derive(Clone)]
pub struct RpcClientOptions {
    pub transport: Arc<dyn Transport>,
    pub codecs: Codecs,
    pub pool: PoolOptions,
    pub dial_timeout: Duration,
    /// Bound on each send and receive. `None` waits for the peer indefinitely.
    pub io_timeout: Option<Duration>,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        Self {
            transport: Arc::new(TcpTransport),
            codecs: Codecs::json_only(),
            pool: PoolOptions::default(),
            dial_timeout: TransportConfig::DEFAULT_DIAL_TIMEOUT,
            io_timeout: None,
        }
    }
}

impl RpcClientOptions {
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_codecs(mut self, codecs: Codecs) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }
}

/// Pooled, one-request-per-connection client.
pub struct RpcClient {
    options: RpcClientOptions,
    pool: Pool,
}

impl RpcClient {
    pub fn new(options: RpcClientOptions) -> Self {
        let pool = Pool::new(options.pool);
        Self { options, pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn codec(&self, opts: &CallOptions) -> Result<Arc<dyn Codec>> {
        let name = opts.codec.as_deref().unwrap_or(ClientConfig::DEFAULT_CODEC);
        self.options.codecs.get(name)
    }

    fn dial_options(&self, opts: &CallOptions) -> DialOptions {
        DialOptions {
            timeout: self.options.dial_timeout,
            io_timeout: self.options.io_timeout,
            tls: opts.tls.clone(),
        }
    }

    async fn exchange(&self, address: &str, request: &WireMessage, opts: &CallOptions) -> Result<WireMessage> {
        // Rejected before a connection is taken, so a healthy one is not discarded.
        check_frame(request)?;

        let mut conn = self
            .pool
            .get_conn(address, self.options.transport.as_ref(), &self.dial_options(opts))
            .await?;

        let result = match conn.connection().send(request).await {
            Ok(()) => conn.connection().recv().await,
            Err(e) => Err(e),
        };

        self.pool.release(address, conn, result.as_ref().err()).await;
        result
    }
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new(RpcClientOptions::default())
    }
}

#[async_trait]
impl Client for RpcClient {
    fn protocol(&self) -> &str {
        ServerConfig::DEFAULT_PROTOCOL
    }

    fn transport_name(&self) -> &str {
        self.options.transport.name()
    }

    fn codec_names(&self) -> Vec<String> {
        self.options.codecs.names()
    }

    async fn call(
        &self,
        ctx: &CallContext,
        address: &str,
        service: &str,
        func: &str,
        request: Value,
        opts: &CallOptions,
    ) -> Result<Value> {
        let codec = self.codec(opts)?;
        let body = codec.marshal(&request)?;

        let request = protocol::format(Envelope {
            service_name: service.to_string(),
            func_name: func.to_string(),
            codec: codec.name().to_string(),
            error: String::new(),
            metadata: ctx.metadata().clone(),
            body,
        });

        debug!("Calling {}.{} at {}", service, func, address);
        let response = protocol::parse(self.exchange(address, &request, opts).await?);

        if response.is_error() {
            return Err(DodoError::Remote {
                message: response.error,
            });
        }

        codec.unmarshal(&response.body)
    }
}
