//! Service discovery backends.
//!
//! A [`Registry`] stores [`Service`] records under
//! `/dodo/<name>/<side>s/<canonical>` and streams changes through a
//! [`Watcher`]. [`SqliteRegistry`] is the reference backend.

mod service;
mod sqlite;

pub use service::{contains, Service};
pub use sqlite::SqliteRegistry;

use crate::config::RegistryConfig;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of change reported by a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Update => write!(f, "update"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

/// One change to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: Action,
    pub service: Service,
}

/// Stream of registry changes.
#[async_trait]
pub trait Watcher: Send {
    /// Wait for the next change. Fails once the watcher is stopped or broken.
    async fn next(&mut self) -> Result<WatchEvent>;

    fn stop(&mut self);
}

#[async_trait]
pub trait Registry: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Store or refresh a record. It expires after `ttl` unless registered again.
    async fn register(&self, service: &Service, ttl: Duration) -> Result<()>;

    async fn deregister(&self, service: &Service) -> Result<()>;

    /// Live records for one service name.
    async fn get_service(&self, name: &str) -> Result<Vec<Service>>;

    /// Every live record.
    async fn list_services(&self) -> Result<Vec<Service>>;

    async fn watch(&self) -> Result<Box<dyn Watcher>>;
}

/// Storage key for a record.
pub fn service_key(service: &Service) -> String {
    format!(
        "{}/{}/{}s/{}",
        RegistryConfig::KEY_PREFIX,
        service.name,
        service.side,
        service.format()
    )
}
