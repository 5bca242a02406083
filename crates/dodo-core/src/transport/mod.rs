//! Pluggable byte transports.
//!
//! A transport moves [`WireMessage`]s between a client and a server. It knows
//! nothing about services or codecs: the header is an opaque string map and
//! the body opaque bytes. The reference implementation is [`TcpTransport`],
//! which frames one message per length-prefixed frame and can run over TLS.

mod frame;
mod tcp;
pub mod tls;

pub use frame::{check_frame, read_message, write_message};
pub use tcp::TcpTransport;

use crate::config::TransportConfig;
use crate::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// One unit of traffic: a string header map and an opaque body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireMessage {
    pub header: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl WireMessage {
    pub fn new(header: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self { header, body }
    }
}

/// Options applied when dialing a remote address.
#[derive(Clone)]
pub struct DialOptions {
    /// Upper bound on connection establishment, including the TLS handshake.
    pub timeout: Duration,
    /// Upper bound on each send or receive. `None` waits indefinitely.
    pub io_timeout: Option<Duration>,
    /// Dial over TLS with this configuration.
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            timeout: TransportConfig::DEFAULT_DIAL_TIMEOUT,
            io_timeout: None,
            tls: None,
        }
    }
}

impl DialOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }
}

impl std::fmt::Debug for DialOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialOptions")
            .field("timeout", &self.timeout)
            .field("io_timeout", &self.io_timeout)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Options applied when listening.
#[derive(Clone, Default)]
pub struct ListenOptions {
    /// Terminate TLS on accepted connections with this configuration.
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

impl std::fmt::Debug for ListenOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenOptions")
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// A bidirectional message stream carrying one request/response at a time.
#[async_trait]
pub trait Connection: Send + 'static {
    async fn send(&mut self, msg: &WireMessage) -> Result<()>;

    async fn recv(&mut self) -> Result<WireMessage>;

    async fn close(&mut self) -> Result<()>;

    /// Address of the remote end.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// An accepted connection whose handshake has not completed yet.
///
/// The handshake future is driven by the per-connection task so a slow TLS
/// peer never blocks the accept loop.
pub struct Accepted {
    pub peer: SocketAddr,
    pub connection: BoxFuture<'static, Result<Box<dyn Connection>>>,
}

/// A bound server socket.
#[async_trait]
pub trait Listener: Send + 'static {
    async fn accept(&mut self) -> Result<Accepted>;

    /// Address the listener is bound to.
    fn local_addr(&self) -> SocketAddr;

    async fn close(&mut self) -> Result<()>;
}

/// Factory for connections and listeners.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn dial(&self, address: &str, opts: &DialOptions) -> Result<Box<dyn Connection>>;

    async fn listen(&self, address: &str, opts: &ListenOptions) -> Result<Box<dyn Listener>>;
}
