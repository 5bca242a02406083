//! Payload serialization.
//!
//! Codecs convert between raw body bytes and the codec-neutral
//! [`serde_json::Value`] form that flows through invokers. Typed requests
//! and responses are converted to and from `Value` at the edges, so a codec
//! only has to know how to lay a value out on the wire.

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgpackCodec;

use crate::{DodoError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A serialization strategy for request/response payloads.
pub trait Codec: Send + Sync + 'static {
    /// Encode a value into body bytes.
    fn marshal(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode body bytes into a value.
    fn unmarshal(&self, data: &[u8]) -> Result<Value>;

    /// Codec name as advertised in service records and envelopes.
    fn name(&self) -> &str;
}

/// Codecs indexed by name, preserving registration order.
#[derive(Clone, Default)]
pub struct Codecs {
    ordered: Vec<Arc<dyn Codec>>,
    by_name: HashMap<String, Arc<dyn Codec>>,
}

impl Codecs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from a list, keeping the first codec for each name.
    pub fn from_list(codecs: impl IntoIterator<Item = Arc<dyn Codec>>) -> Self {
        let mut set = Self::new();
        for codec in codecs {
            set.add(codec);
        }
        set
    }

    /// The default set: JSON only.
    pub fn json_only() -> Self {
        Self::from_list([Arc::new(JsonCodec) as Arc<dyn Codec>])
    }

    /// Add a codec. A codec whose name is already present is ignored.
    pub fn add(&mut self, codec: Arc<dyn Codec>) {
        let name = codec.name().to_string();
        if self.by_name.contains_key(&name) {
            return;
        }
        self.by_name.insert(name, codec.clone());
        self.ordered.push(codec);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Codec>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| DodoError::CodecNotFound(name.to_string()))
    }

    /// Codec names in registration order, without duplicates.
    pub fn names(&self) -> Vec<String> {
        self.ordered.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

impl std::fmt::Debug for Codecs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
