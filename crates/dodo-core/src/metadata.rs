//! Call-scoped metadata.
//!
//! A [`CallContext`] travels with every invocation. On the client side its
//! metadata is copied into the request envelope; on the server side the
//! envelope's metadata is turned back into a context for the handler.

use std::collections::HashMap;

/// Per-call context carrying string metadata (trace ids, auth tokens, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    metadata: HashMap<String, String>,
}

impl CallContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context from an existing metadata map.
    pub fn with_metadata(metadata: HashMap<String, String>) -> Self {
        Self { metadata }
    }

    /// Return a copy of this context with one more metadata entry.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn into_metadata(self) -> HashMap<String, String> {
        self.metadata
    }
}
