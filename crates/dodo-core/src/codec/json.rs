//! JSON codec backed by serde_json.

use super::Codec;
use crate::Result;
use serde_json::Value;

/// Codec named `json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn marshal(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(data)?)
    }

    fn name(&self) -> &str {
        "json"
    }
}
