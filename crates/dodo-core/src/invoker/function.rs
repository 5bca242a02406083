//! Invoker wrapping a single free function.

use super::{descriptor, erase, FunctionDescriptor, HandlerTable, Interceptor, Invoker, Message};
use crate::metadata::CallContext;
use crate::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

/// Exposes one async function. The service name defaults to the function name.
///
/// ```rust,ignore
/// let invoker = FunctionInvoker::new("SayHello", |_ctx, name: String| async move {
///     Ok::<_, String>(format!("{} dodo", name))
/// });
/// ```
pub struct FunctionInvoker {
    table: HandlerTable,
}

impl FunctionInvoker {
    pub fn new<Req, Resp, E, F, Fut>(func_name: impl Into<String>, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + 'static,
        E: Display + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, E>> + Send + 'static,
    {
        let func_name = func_name.into();
        let mut table = HandlerTable::new(func_name.clone());
        table.insert(descriptor::<Req, Resp>(&func_name), erase(f));
        Self { table }
    }

    /// Override the service name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.table.name = name.into();
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.table.interceptors.push(interceptor);
        self
    }
}

#[async_trait]
impl Invoker for FunctionInvoker {
    fn name(&self) -> &str {
        &self.table.name
    }

    fn functions(&self) -> Vec<FunctionDescriptor> {
        self.table.functions()
    }

    fn function(&self, name: &str) -> Result<FunctionDescriptor> {
        self.table.function(name)
    }

    fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.table.interceptors
    }

    async fn invoke(
        &self,
        ctx: CallContext,
        msg: Message,
        interceptors: &[Arc<dyn Interceptor>],
    ) -> Result<Message> {
        self.table.invoke(ctx, msg, interceptors).await
    }
}
