//! Server side: accept connections and dispatch requests to invokers.

mod rpc;

pub use rpc::{RpcServer, RpcServerOptions};

use crate::invoker::Invoker;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// A protocol server hosting one or more invokers.
///
/// `start` and `stop` are reference counted: every `start` must be paired
/// with a `stop`, and only the first `start` and the matching last `stop`
/// touch the listener. A stopped server stays stopped.
#[async_trait]
pub trait Server: Send + Sync + 'static {
    /// Protocol name, written into service records.
    fn name(&self) -> &str;

    fn transport_name(&self) -> &str;

    fn codec_names(&self) -> Vec<String>;

    fn tls_enabled(&self) -> bool;

    /// Make an invoker reachable under its name.
    async fn register(&self, invoker: Arc<dyn Invoker>) -> Result<()>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Address clients should dial, available once started.
    async fn advertised_address(&self) -> Option<String>;
}
