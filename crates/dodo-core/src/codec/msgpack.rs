//! MessagePack codec backed by rmp-serde.

use super::Codec;
use crate::Result;
use serde_json::Value;

/// Codec named `msgpack`.
///
/// Maps are written with field names so any `Value` survives the trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn marshal(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value> {
        Ok(rmp_serde::from_slice(data)?)
    }

    fn name(&self) -> &str {
        "msgpack"
    }
}
