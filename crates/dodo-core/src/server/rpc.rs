//! The `rpc` protocol server.
//!
//! One background task owns the listener. It accepts until the server is
//! stopped, then waits for in-flight requests (unless `wait` is off) and
//! closes the listener. Every accepted connection gets its own task that
//! serves requests strictly one after another.

use super::Server;
use crate::codec::Codecs;
use crate::config::ServerConfig;
use crate::invoker::{Invoker, InvokerManager, Message};
use crate::metadata::CallContext;
use crate::protocol::{self, Envelope};
use crate::transport::{check_frame, tls, Connection, ListenOptions, Listener, TcpTransport, Transport, WireMessage};
use crate::{DodoError, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Options for [`RpcServer`].
#[derive(Clone)]
pub struct RpcServerOptions {
    /// Bind address.
    pub address: String,
    /// Address written into service records instead of the bound one.
    pub advertise: Option<String>,
    /// On stop, let in-flight requests finish before closing the listener.
    pub wait: bool,
    pub tls: bool,
    /// PEM certificate chain. Without both files a self-signed certificate is generated.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub transport: Arc<dyn Transport>,
    pub codecs: Codecs,
    /// Connections served concurrently; extra ones are dropped on accept.
    pub max_connections: usize,
}

impl Default for RpcServerOptions {
    fn default() -> Self {
        Self {
            address: ServerConfig::DEFAULT_ADDRESS.to_string(),
            advertise: None,
            wait: true,
            tls: false,
            tls_cert: None,
            tls_key: None,
            transport: Arc::new(TcpTransport),
            codecs: Codecs::json_only(),
            max_connections: ServerConfig::MAX_CONNECTIONS,
        }
    }
}

impl RpcServerOptions {
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_advertise(mut self, address: impl Into<String>) -> Self {
        self.advertise = Some(address.into());
        self
    }

    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_tls_files(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls = true;
        self.tls_cert = Some(cert.into());
        self.tls_key = Some(key.into());
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_codecs(mut self, codecs: Codecs) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    fn listen_options(&self) -> Result<ListenOptions> {
        if !self.tls {
            return Ok(ListenOptions::default());
        }
        let config = match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => tls::load_server_config(cert, key)?,
            _ => tls::self_signed(tls::certificate_hosts(&self.address))?.config,
        };
        Ok(ListenOptions { tls: Some(config) })
    }
}

#[derive(Default)]
struct Lifecycle {
    count: usize,
    started: bool,
    stopped: bool,
    running: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

/// State shared with connection tasks.
struct Dispatcher {
    invokers: InvokerManager,
    codecs: Codecs,
}

/// Reference-counted server with graceful drain and per-request fault isolation.
pub struct RpcServer {
    options: RpcServerOptions,
    dispatcher: Arc<Dispatcher>,
    lifecycle: Mutex<Lifecycle>,
}

impl RpcServer {
    pub fn new(options: RpcServerOptions) -> Self {
        let dispatcher = Arc::new(Dispatcher {
            invokers: InvokerManager::new(),
            codecs: options.codecs.clone(),
        });
        Self {
            options,
            dispatcher,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn options(&self) -> &RpcServerOptions {
        &self.options
    }

    async fn open(&self) -> Result<Running> {
        let listen_options = self.options.listen_options()?;
        let listener = self
            .options
            .transport
            .listen(&self.options.address, &listen_options)
            .await?;
        let local_addr = listener.local_addr();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(
            listener,
            self.dispatcher.clone(),
            shutdown.clone(),
            self.options.wait,
            self.options.max_connections,
        ));

        Ok(Running {
            local_addr,
            shutdown,
            task,
        })
    }
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new(RpcServerOptions::default())
    }
}

#[async_trait]
impl Server for RpcServer {
    fn name(&self) -> &str {
        ServerConfig::DEFAULT_PROTOCOL
    }

    fn transport_name(&self) -> &str {
        self.options.transport.name()
    }

    fn codec_names(&self) -> Vec<String> {
        self.options.codecs.names()
    }

    fn tls_enabled(&self) -> bool {
        self.options.tls
    }

    async fn register(&self, invoker: Arc<dyn Invoker>) -> Result<()> {
        let name = invoker.name().to_string();
        self.dispatcher.invokers.insert(invoker).await?;
        debug!("Registered invoker {}", name);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let mut state = self.lifecycle.lock().await;
        state.count += 1;
        if state.count > 1 || state.started {
            return Ok(());
        }

        state.started = true;
        match self.open().await {
            Ok(running) => {
                info!("RPC server started on {}", running.local_addr);
                state.running = Some(running);
                Ok(())
            }
            Err(e) => {
                state.started = false;
                state.count -= 1;
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.lifecycle.lock().await;
        if !state.started {
            return Ok(());
        }
        state.count = state.count.saturating_sub(1);
        if state.count > 0 || state.stopped {
            return Ok(());
        }

        state.stopped = true;
        let Some(running) = state.running.take() else {
            return Ok(());
        };

        info!("RPC server on {} stopping", running.local_addr);
        running.shutdown.cancel();
        match running.task.await {
            Ok(result) => result,
            Err(e) => Err(DodoError::Other(format!("server task failed: {}", e))),
        }
    }

    async fn advertised_address(&self) -> Option<String> {
        if let Some(address) = &self.options.advertise {
            return Some(address.clone());
        }
        let state = self.lifecycle.lock().await;
        state
            .running
            .as_ref()
            .map(|running| advertised(running.local_addr))
    }
}

/// Bound address with an unspecified host replaced by loopback.
fn advertised(mut addr: SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    addr.to_string()
}

async fn serve(
    mut listener: Box<dyn Listener>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    wait: bool,
    max_connections: usize,
) -> Result<()> {
    let tracker = TaskTracker::new();
    let permits = Arc::new(Semaphore::new(max_connections));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let accepted = match accepted {
                    Ok(accepted) => accepted,
                    Err(DodoError::ConnectionClosed) => break,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                };

                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    warn!(
                        "Rejecting connection from {}: at max capacity ({})",
                        accepted.peer, max_connections
                    );
                    continue;
                };

                let dispatcher = dispatcher.clone();
                let shutdown = shutdown.clone();
                tracker.spawn(async move {
                    let _permit = permit;
                    match accepted.connection.await {
                        Ok(conn) => handle_connection(conn, &dispatcher, &shutdown).await,
                        Err(e) => debug!("Connection from {} failed to open: {}", accepted.peer, e),
                    }
                });
            }
        }
    }

    tracker.close();
    if wait {
        debug!("Waiting for {} connection(s) to drain", tracker.len());
        tracker.wait().await;
    }
    listener.close().await
}

async fn handle_connection(
    mut conn: Box<dyn Connection>,
    dispatcher: &Dispatcher,
    shutdown: &CancellationToken,
) {
    let peer = conn.peer_addr();
    debug!("Connection from {:?}", peer);

    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = conn.recv() => match received {
                Ok(msg) => msg,
                Err(DodoError::ConnectionClosed) => break,
                Err(e) => {
                    debug!("Connection {:?} ended: {}", peer, e);
                    break;
                }
            },
        };

        let response = dispatcher.handle(request).await;
        if let Err(e) = conn.send(&response).await {
            debug!("Failed to reply to {:?}: {}", peer, e);
            break;
        }
    }

    let _ = conn.close().await;
}

impl Dispatcher {
    /// Serve one request. Never fails: every problem becomes the Error header.
    async fn handle(&self, msg: WireMessage) -> WireMessage {
        let request = protocol::parse(msg);
        let mut response = Envelope {
            service_name: request.service_name.clone(),
            func_name: request.func_name.clone(),
            codec: request.codec.clone(),
            error: String::new(),
            metadata: HashMap::new(),
            body: Vec::new(),
        };

        match AssertUnwindSafe(self.dispatch(request)).catch_unwind().await {
            Ok(Ok(body)) => response.body = body,
            Ok(Err(e)) => {
                debug!(
                    "Request {}.{} failed: {}",
                    response.service_name, response.func_name, e
                );
                response.error = e.to_string();
            }
            Err(panic) => {
                error!(
                    "Panic while handling {}.{}: {}",
                    response.service_name,
                    response.func_name,
                    panic_message(panic.as_ref())
                );
                response.error = ServerConfig::INTERNAL_ERROR_MESSAGE.to_string();
            }
        }

        let service_name = response.service_name.clone();
        let func_name = response.func_name.clone();
        let codec = response.codec.clone();
        let reply = protocol::format(response);

        // A reply that cannot be framed must not take the connection down with it.
        match check_frame(&reply) {
            Ok(()) => reply,
            Err(e) => {
                warn!("Reply to {}.{} not sent: {}", service_name, func_name, e);
                protocol::format(Envelope {
                    service_name,
                    func_name,
                    codec,
                    error: e.to_string(),
                    ..Envelope::default()
                })
            }
        }
    }

    async fn dispatch(&self, request: Envelope) -> Result<Vec<u8>> {
        let invoker = self
            .invokers
            .get(&request.service_name)
            .await
            .ok_or_else(|| DodoError::ServiceNotFound(request.service_name.clone()))?;
        invoker.function(&request.func_name)?;
        let codec = self.codecs.get(&request.codec)?;
        let payload = codec.unmarshal(&request.body)?;

        let ctx = CallContext::with_metadata(request.metadata);
        let out = invoker
            .invoke(ctx, Message::new(request.func_name, payload), &[])
            .await?;

        if let Some(message) = out.error {
            return Err(DodoError::Remote { message });
        }
        codec.marshal(&out.payload)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
