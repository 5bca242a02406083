//! Centralized configuration defaults for dodo.
//!
//! Components never read these constants behind the caller's back: each one
//! takes an options struct whose `Default` impl is built from the values
//! below, so every knob can be overridden per instance.

use std::time::Duration;

/// Connection pool defaults.
pub struct PoolConfig;

impl PoolConfig {
    /// Idle connections kept per address.
    pub const DEFAULT_SIZE: usize = 1;
    /// Pooled connections older than this are closed instead of reused.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
}

/// Transport defaults.
pub struct TransportConfig;

impl TransportConfig {
    pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
    pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    /// Largest frame accepted on the wire (16 MiB).
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
}

/// Server defaults.
pub struct ServerConfig;

impl ServerConfig {
    pub const DEFAULT_ADDRESS: &'static str = "0.0.0.0:17312";
    pub const DEFAULT_PROTOCOL: &'static str = "rpc";
    pub const MAX_CONNECTIONS: usize = 1024;
    /// Message placed in the Error header when a request faults unexpectedly.
    pub const INTERNAL_ERROR_MESSAGE: &'static str = "Internal Server Error";
}

/// Client defaults.
pub struct ClientConfig;

impl ClientConfig {
    pub const DEFAULT_CODEC: &'static str = "json";
}

/// Selector defaults.
pub struct SelectorConfig;

impl SelectorConfig {
    pub const DEFAULT_CACHE_DIR: &'static str = ".dodo/consumer/selector";
    pub const DEFAULT_CONFIG_DIR: &'static str = "../config/selector";
    pub const REFRESH_INTERVAL: Duration = Duration::from_secs(10);
    pub const SNAPSHOT_EXTENSION: &'static str = "json";
    pub const WATCH_BACKOFF_BASE: Duration = Duration::from_secs(1);
    pub const WATCH_BACKOFF_MAX: Duration = Duration::from_secs(60);
}

/// Provider defaults.
pub struct ProviderConfig;

impl ProviderConfig {
    pub const DEFAULT_VERSION: &'static str = "0.1.0";
    pub const REGISTER_INTERVAL: Duration = Duration::from_secs(20);
    pub const REGISTER_TTL: Duration = Duration::from_secs(60);
    pub const SIDE: &'static str = "provider";
}

/// Registry defaults.
pub struct RegistryConfig;

impl RegistryConfig {
    /// Root of every registry key.
    pub const KEY_PREFIX: &'static str = "/dodo";
    pub const BUSY_TIMEOUT_MS: u32 = 5000;
    /// Buffered change events per watcher before it is considered lagging.
    pub const WATCH_CHANNEL_CAPACITY: usize = 256;
}
