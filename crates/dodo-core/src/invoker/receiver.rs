//! Invoker exposing methods of a receiver object.

use super::{descriptor, erase, FunctionDescriptor, HandlerTable, Interceptor, Invoker, Message};
use crate::metadata::CallContext;
use crate::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

/// Exposes registered methods of a shared receiver `T`.
///
/// The service name defaults to the type name of `T` without its module path.
pub struct ReceiverInvoker<T> {
    receiver: Arc<T>,
    table: HandlerTable,
}

/// Type name without module path or generic arguments.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

impl<T: Send + Sync + 'static> ReceiverInvoker<T> {
    pub fn new(receiver: T) -> Self {
        Self::from_arc(Arc::new(receiver))
    }

    pub fn from_arc(receiver: Arc<T>) -> Self {
        Self {
            receiver,
            table: HandlerTable::new(short_type_name::<T>()),
        }
    }

    /// Register a method under `name`.
    pub fn method<Req, Resp, E, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + 'static,
        E: Display + 'static,
        F: Fn(Arc<T>, CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, E>> + Send + 'static,
    {
        let receiver = self.receiver.clone();
        let handler = erase(move |ctx: CallContext, req: Req| f(receiver.clone(), ctx, req));
        self.table.insert(descriptor::<Req, Resp>(name), handler);
        self
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

    pub fn receiver(&self) -> &Arc<T> {
        &self.receiver
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Invoker for ReceiverInvoker<T> {
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
