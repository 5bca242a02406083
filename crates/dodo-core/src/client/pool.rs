//! Per-address connection pool.
//!
//! Connections are handed out exclusively: a caller takes one with
//! [`Pool::get_conn`], runs exactly one request/response on it, then gives it
//! back with [`Pool::release`]. Anything that went wrong during the call
//! means the connection is closed rather than pooled.

use crate::config::PoolConfig;
use crate::transport::{Connection, DialOptions, Transport};
use crate::{DodoError, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Idle connections kept per address. Zero disables pooling.
    pub size: usize,
    /// Connections older than this are never reused.
    pub ttl: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: PoolConfig::DEFAULT_SIZE,
            ttl: PoolConfig::DEFAULT_TTL,
        }
    }
}

impl PoolOptions {
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// A connection checked out of the pool.
pub struct PooledConnection {
    conn: Box<dyn Connection>,
    created: Instant,
}

impl PooledConnection {
    pub fn connection(&mut self) -> &mut dyn Connection {
        self.conn.as_mut()
    }

    pub fn created(&self) -> Instant {
        self.created
    }
}

pub struct Pool {
    options: PoolOptions,
    idle: Mutex<HashMap<String, Vec<PooledConnection>>>,
}

impl Pool {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            options,
            idle: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> PoolOptions {
        self.options
    }

    /// Take an idle connection younger than the TTL, or dial a new one.
    pub async fn get_conn(
        &self,
        address: &str,
        transport: &dyn Transport,
        opts: &DialOptions,
    ) -> Result<PooledConnection> {
        let mut stale = Vec::new();
        let reused = {
            let mut idle = self.idle.lock().await;
            let mut found = None;
            if let Some(entries) = idle.get_mut(address) {
                while let Some(entry) = entries.pop() {
                    if entry.created.elapsed() < self.options.ttl {
                        found = Some(entry);
                        break;
                    }
                    stale.push(entry);
                }
                if entries.is_empty() {
                    idle.remove(address);
                }
            }
            found
        };

        for mut entry in stale {
            trace!("Closing expired connection to {}", address);
            let _ = entry.conn.close().await;
        }

        if let Some(entry) = reused {
            trace!("Reusing pooled connection to {}", address);
            return Ok(entry);
        }

        let conn = transport.dial(address, opts).await?;
        debug!("Opened connection to {}", address);
        Ok(PooledConnection {
            conn,
            created: Instant::now(),
        })
    }

    /// Return a connection after a call.
    ///
    /// With `err` set the connection is closed. Otherwise it goes back to the
    /// idle set unless that set is full or the connection has outlived the TTL.
    pub async fn release(&self, address: &str, mut conn: PooledConnection, err: Option<&DodoError>) {
        if let Some(err) = err {
            debug!("Discarding connection to {} after error: {}", address, err);
            let _ = conn.conn.close().await;
            return;
        }

        if conn.created.elapsed() < self.options.ttl {
            let mut idle = self.idle.lock().await;
            let entries = idle.entry(address.to_string()).or_default();
            if entries.len() < self.options.size {
                entries.push(conn);
                return;
            }
            if entries.is_empty() {
                idle.remove(address);
            }
        }

        let _ = conn.conn.close().await;
    }

    /// Idle connections currently held for an address.
    pub async fn idle_count(&self, address: &str) -> usize {
        self.idle.lock().await.get(address).map_or(0, Vec::len)
    }

    /// Close every idle connection.
    pub async fn close(&self) {
        let drained: Vec<_> = self.idle.lock().await.drain().collect();
        for (_, entries) in drained {
            for mut entry in entries {
                let _ = entry.conn.close().await;
            }
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new(PoolOptions::default())
    }
}
