//! Selector that queries the registry on every call.

use super::{pick, SelectOptions, Selector};
use crate::registry::{Registry, Service};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub struct SimpleSelector {
    registry: Arc<dyn Registry>,
}

impl SimpleSelector {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Selector for SimpleSelector {
    fn name(&self) -> &str {
        "simple"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn select(&self, service: &str, opts: &SelectOptions) -> Result<Service> {
        let candidates = self.registry.get_service(service).await?;
        pick(service, candidates, opts)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
