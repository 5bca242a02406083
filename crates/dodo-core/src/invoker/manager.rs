//! Name-indexed invoker registry.

use super::{Invoker, PassThroughInvoker};
use crate::{DodoError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Invokers by name. Lookups take the read lock, installs the write lock.
#[derive(Default)]
pub struct InvokerManager {
    invokers: RwLock<HashMap<String, Arc<dyn Invoker>>>,
}

impl InvokerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an invoker. Fails if its name is taken.
    pub async fn insert(&self, invoker: Arc<dyn Invoker>) -> Result<()> {
        let mut invokers = self.invokers.write().await;
        let name = invoker.name().to_string();
        if invokers.contains_key(&name) {
            return Err(DodoError::DuplicateService(name));
        }
        invokers.insert(name, invoker);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Invoker>> {
        self.invokers.read().await.get(name).cloned()
    }

    /// Resolve an invoker, installing a pass-through one for unknown names.
    pub async fn get_or_default(&self, name: &str) -> Arc<dyn Invoker> {
        if let Some(invoker) = self.get(name).await {
            return invoker;
        }

        let mut invokers = self.invokers.write().await;
        invokers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Installing pass-through invoker for {}", name);
                Arc::new(PassThroughInvoker::new(name)) as Arc<dyn Invoker>
            })
            .clone()
    }

    pub async fn remove(&self, name: &str) -> Option<Arc<dyn Invoker>> {
        self.invokers.write().await.remove(name)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.invokers.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
