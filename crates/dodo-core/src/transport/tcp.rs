//! TCP transport, optionally wrapped in TLS.

use super::frame::{read_message, write_message};
use super::{tls, Accepted, Connection, DialOptions, ListenOptions, Listener, Transport, WireMessage};
use crate::config::TransportConfig;
use crate::{DodoError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// Transport named `tcp`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn dial(&self, address: &str, opts: &DialOptions) -> Result<Box<dyn Connection>> {
        let dial = async {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            let peer = stream.peer_addr().ok();

            let connection: Box<dyn Connection> = match &opts.tls {
                Some(config) => {
                    let name = tls::server_name(address)?;
                    let stream = TlsConnector::from(config.clone())
                        .connect(name, stream)
                        .await?;
                    Box::new(StreamConnection::new(stream, peer, opts.io_timeout))
                }
                None => Box::new(StreamConnection::new(stream, peer, opts.io_timeout)),
            };
            Ok::<_, DodoError>(connection)
        };

        let connection = tokio::time::timeout(opts.timeout, dial)
            .await
            .map_err(|_| DodoError::Dial {
                address: address.to_string(),
                message: format!("timed out after {:?}", opts.timeout),
            })?
            .map_err(|e| DodoError::Dial {
                address: address.to_string(),
                message: e.to_string(),
            })?;

        debug!("Dialed {} (tls: {})", address, opts.tls.is_some());
        Ok(connection)
    }

    async fn listen(&self, address: &str, opts: &ListenOptions) -> Result<Box<dyn Listener>> {
        let listener = tokio::net::TcpListener::bind(address)
            .await
            .map_err(|e| DodoError::Io {
                message: format!("failed to bind {}: {}", address, e),
                path: None,
                source: Some(e),
            })?;
        let local_addr = listener.local_addr()?;

        info!("Listening on {} (tls: {})", local_addr, opts.tls.is_some());

        Ok(Box::new(TcpListener {
            listener: Some(listener),
            local_addr,
            acceptor: opts.tls.clone().map(TlsAcceptor::from),
        }))
    }
}

struct TcpListener {
    listener: Option<tokio::net::TcpListener>,
    local_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&mut self) -> Result<Accepted> {
        let listener = self.listener.as_ref().ok_or(DodoError::ConnectionClosed)?;
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;

        let connection: BoxFuture<'static, Result<Box<dyn Connection>>> = match self.acceptor.clone() {
            Some(acceptor) => Box::pin(async move {
                let stream = with_timeout(
                    TransportConfig::TLS_HANDSHAKE_TIMEOUT,
                    acceptor.accept(stream),
                )
                .await?
                .map_err(|e| DodoError::Tls {
                    message: format!("handshake with {} failed: {}", peer, e),
                })?;
                Ok(Box::new(StreamConnection::new(stream, Some(peer), None)) as Box<dyn Connection>)
            }),
            None => Box::pin(async move {
                Ok(Box::new(StreamConnection::new(stream, Some(peer), None)) as Box<dyn Connection>)
            }),
        };

        Ok(Accepted { peer, connection })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn close(&mut self) -> Result<()> {
        if self.listener.take().is_some() {
            info!("Closed listener on {}", self.local_addr);
        }
        Ok(())
    }
}

async fn with_timeout<F: Future>(limit: Duration, fut: F) -> Result<F::Output> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| DodoError::Timeout(limit))
}

/// Framed message stream over any byte stream.
struct StreamConnection<S> {
    stream: S,
    peer: Option<SocketAddr>,
    io_timeout: Option<Duration>,
    closed: bool,
}

impl<S> StreamConnection<S> {
    fn new(stream: S, peer: Option<SocketAddr>, io_timeout: Option<Duration>) -> Self {
        Self {
            stream,
            peer,
            io_timeout,
            closed: false,
        }
    }
}

#[async_trait]
impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, msg: &WireMessage) -> Result<()> {
        if self.closed {
            return Err(DodoError::ConnectionClosed);
        }
        let result = match self.io_timeout {
            Some(limit) => with_timeout(limit, write_message(&mut self.stream, msg)).await?,
            None => write_message(&mut self.stream, msg).await,
        };
        result.map_err(|e| match e {
            DodoError::FrameTooLarge { .. } => e,
            other => DodoError::Send {
                message: other.to_string(),
            },
        })
    }

    async fn recv(&mut self) -> Result<WireMessage> {
        if self.closed {
            return Err(DodoError::ConnectionClosed);
        }
        let result = match self.io_timeout {
            Some(limit) => with_timeout(limit, read_message(&mut self.stream)).await?,
            None => read_message(&mut self.stream).await,
        };
        match result {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(DodoError::ConnectionClosed),
            Err(e @ DodoError::FrameTooLarge { .. }) => Err(e),
            Err(other) => Err(DodoError::Recv {
                message: other.to_string(),
            }),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
