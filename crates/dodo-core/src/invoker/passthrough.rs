//! Invoker that hands back its input.

use super::{run_chain, Endpoint, FunctionDescriptor, Interceptor, Invoker, Message};
use crate::metadata::CallContext;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Placeholder invoker for names nothing was registered under.
///
/// Used on the consumer side, where the real work happens in a terminal
/// interceptor and the invoker only provides the chain to run it in.
pub struct PassThroughInvoker {
    name: String,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl PassThroughInvoker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interceptors: Vec::new(),
        }
    }
}

struct Identity;

#[async_trait]
impl Endpoint for Identity {
    async fn call(&self, _ctx: CallContext, msg: Message) -> Result<Message> {
        Ok(msg)
    }
}

#[async_trait]
impl Invoker for PassThroughInvoker {
    fn name(&self) -> &str {
        &self.name
    }

    fn functions(&self) -> Vec<FunctionDescriptor> {
        Vec::new()
    }

    /// Any function name resolves.
    fn function(&self, name: &str) -> Result<FunctionDescriptor> {
        Ok(FunctionDescriptor {
            name: name.to_string(),
            request_type: "serde_json::Value",
            response_type: "serde_json::Value",
        })
    }

    fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.interceptors
    }

    async fn invoke(
        &self,
        ctx: CallContext,
        msg: Message,
        interceptors: &[Arc<dyn Interceptor>],
    ) -> Result<Message> {
        run_chain(ctx, msg, interceptors, &self.interceptors, &Identity).await
    }
}
