//! Invokers map function names to callable targets.
//!
//! An [`Invoker`] is the unit a server dispatches to and a consumer calls
//! through. Every invocation runs an onion of [`Interceptor`]s: the
//! call-scoped ones first, then the invoker's own, then the terminal stage
//! that actually runs the function. The first interceptor listed is the
//! outermost one.

mod function;
mod manager;
mod passthrough;
mod receiver;

pub use function::FunctionInvoker;
pub use manager::InvokerManager;
pub use passthrough::PassThroughInvoker;
pub use receiver::ReceiverInvoker;

use crate::metadata::CallContext;
use crate::{DodoError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

/// Invoker-level message: a function name plus a codec-neutral payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub func_name: String,
    /// Request on the way in, response on the way out.
    pub payload: Value,
    /// Application error returned by the handler.
    pub error: Option<String>,
    pub attachments: HashMap<String, String>,
}

impl Message {
    pub fn new(func_name: impl Into<String>, payload: Value) -> Self {
        Self {
            func_name: func_name.into(),
            payload,
            ..Self::default()
        }
    }
}

/// Shape of one exposed function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDescriptor {
    pub name: String,
    pub request_type: &'static str,
    pub response_type: &'static str,
}

/// The innermost stage of an interceptor chain.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, ctx: CallContext, msg: Message) -> Result<Message>;
}

/// Middleware wrapped around an invocation.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Handle a message. Call `next.run` to continue down the chain, or
    /// return without calling it to short-circuit.
    async fn intercept(&self, ctx: CallContext, msg: Message, next: Next<'_>) -> Result<Message>;
}

/// The remainder of an interceptor chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Interceptor>], endpoint: &'a dyn Endpoint) -> Self {
        Self { chain, endpoint }
    }

    pub async fn run(self, ctx: CallContext, msg: Message) -> Result<Message> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.intercept(ctx, msg, Next::new(rest, self.endpoint))
                    .await
            }
            None => self.endpoint.call(ctx, msg).await,
        }
    }
}

/// Run `endpoint` behind call-scoped then instance-scoped interceptors.
pub async fn run_chain(
    ctx: CallContext,
    msg: Message,
    call_scoped: &[Arc<dyn Interceptor>],
    instance_scoped: &[Arc<dyn Interceptor>],
    endpoint: &dyn Endpoint,
) -> Result<Message> {
    let chain: Vec<Arc<dyn Interceptor>> = call_scoped
        .iter()
        .chain(instance_scoped)
        .cloned()
        .collect();
    Next::new(&chain, endpoint).run(ctx, msg).await
}

/// A named set of callable functions.
#[async_trait]
pub trait Invoker: Send + Sync + 'static {
    /// Dispatch key, matched against the envelope's service name.
    fn name(&self) -> &str;

    fn functions(&self) -> Vec<FunctionDescriptor>;

    fn function(&self, name: &str) -> Result<FunctionDescriptor>;

    fn interceptors(&self) -> &[Arc<dyn Interceptor>];

    /// Invoke `msg.func_name` with `msg.payload`.
    ///
    /// `interceptors` run outside the invoker's own interceptors.
    async fn invoke(
        &self,
        ctx: CallContext,
        msg: Message,
        interceptors: &[Arc<dyn Interceptor>],
    ) -> Result<Message>;
}

/// Outer error: the request could not be run. Inner error: the handler's own failure.
type HandlerResult = Result<std::result::Result<Value, String>>;

type HandlerFn = Arc<dyn Fn(CallContext, Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Type-erase a typed async handler into a `Value -> Value` function.
fn erase<Req, Resp, E, F, Fut>(f: F) -> HandlerFn
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + 'static,
    E: Display + 'static,
    F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Resp, E>> + Send + 'static,
{
    Arc::new(move |ctx: CallContext, payload: Value| -> BoxFuture<'static, HandlerResult> {
        let request = match serde_json::from_value::<Req>(payload) {
            Ok(request) => request,
            Err(e) => {
                let err = DodoError::Codec {
                    message: format!(
                        "failed to decode request as {}: {}",
                        std::any::type_name::<Req>(),
                        e
                    ),
                };
                return Box::pin(async move { Err(err) });
            }
        };

        let fut = f(ctx, request);
        Box::pin(async move {
            match fut.await {
                Ok(response) => Ok(Ok(serde_json::to_value(response)?)),
                Err(e) => Ok(Err(e.to_string())),
            }
        })
    })
}

fn descriptor<Req, Resp>(name: &str) -> FunctionDescriptor {
    FunctionDescriptor {
        name: name.to_string(),
        request_type: std::any::type_name::<Req>(),
        response_type: std::any::type_name::<Resp>(),
    }
}

/// Handlers shared by the function and receiver invokers.
#[derive(Default)]
struct HandlerTable {
    name: String,
    handlers: BTreeMap<String, (FunctionDescriptor, HandlerFn)>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl HandlerTable {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    fn insert(&mut self, descriptor: FunctionDescriptor, handler: HandlerFn) {
        self.handlers
            .insert(descriptor.name.clone(), (descriptor, handler));
    }

    fn functions(&self) -> Vec<FunctionDescriptor> {
        self.handlers.values().map(|(d, _)| d.clone()).collect()
    }

    fn function(&self, name: &str) -> Result<FunctionDescriptor> {
        self.handlers
            .get(name)
            .map(|(d, _)| d.clone())
            .ok_or_else(|| DodoError::FunctionNotFound {
                service: self.name.clone(),
                func: name.to_string(),
            })
    }

    async fn invoke(
        &self,
        ctx: CallContext,
        msg: Message,
        interceptors: &[Arc<dyn Interceptor>],
    ) -> Result<Message> {
        run_chain(ctx, msg, interceptors, &self.interceptors, self).await
    }
}

#[async_trait]
impl Endpoint for HandlerTable {
    async fn call(&self, ctx: CallContext, msg: Message) -> Result<Message> {
        let Message {
            func_name,
            payload,
            attachments,
            ..
        } = msg;

        let (_, handler) = self
            .handlers
            .get(&func_name)
            .ok_or_else(|| DodoError::FunctionNotFound {
                service: self.name.clone(),
                func: func_name.clone(),
            })?;

        let (payload, error) = match handler(ctx, payload).await? {
            Ok(value) => (value, None),
            Err(message) => (Value::Null, Some(message)),
        };

        Ok(Message {
            func_name,
            payload,
            error,
            attachments,
        })
    }
}
