//! Instance selection.
//!
//! A [`Selector`] answers "which instance of service X should this call go
//! to". [`CacheSelector`] keeps a local view of the registry fed by a
//! periodic refresh and a watch stream, backed by snapshots on disk;
//! [`SimpleSelector`] asks the registry every time.

mod cache;
pub mod filter;
mod simple;
pub mod snapshot;
pub mod strategy;

pub use cache::{CacheSelector, CacheSelectorOptions};
pub use filter::Filter;
pub use simple::SimpleSelector;
pub use strategy::Strategy;

use crate::registry::Service;
use crate::{DodoError, Result};
use async_trait::async_trait;

/// Filters and strategy for one selection.
#[derive(Clone)]
pub struct SelectOptions {
    /// Applied in order.
    pub filters: Vec<Filter>,
    pub strategy: Strategy,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            strategy: strategy::random(),
        }
    }
}

impl SelectOptions {
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }
}

#[async_trait]
pub trait Selector: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn init(&self) -> Result<()>;

    /// Pick one instance of `service` satisfying every filter.
    async fn select(&self, service: &str, opts: &SelectOptions) -> Result<Service>;

    /// Report the outcome of a call to `instance`.
    fn mark(&self, _service: &str, _instance: &Service, _err: Option<&DodoError>) {}

    /// Forget anything recorded through [`Selector::mark`].
    fn reset(&self, _service: &str) {}

    async fn close(&self) -> Result<()>;
}

/// Filter `candidates` and let the strategy pick one.
pub(crate) fn pick(service: &str, candidates: Vec<Service>, opts: &SelectOptions) -> Result<Service> {
    if candidates.is_empty() {
        return Err(DodoError::NoneAvailable(service.to_string()));
    }
    let filtered = filter::apply(candidates, &opts.filters);
    (opts.strategy)(&filtered).ok_or_else(|| DodoError::NoneAvailable(service.to_string()))
}
