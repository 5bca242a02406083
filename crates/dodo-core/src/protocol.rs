//! Request/response envelope carried in a [`WireMessage`].
//!
//! Four header keys are reserved; everything else is call metadata and is
//! carried with a `Meta-` prefix so it can never collide with them.
//!
//! | header        | meaning                                   |
//! |---------------|-------------------------------------------|
//! | `ServiceName` | invoker to dispatch to                    |
//! | `FuncName`    | function on that invoker                  |
//! | `Codec`       | codec used for the body                   |
//! | `Error`       | empty on success, error message otherwise |

use crate::transport::WireMessage;
use std::collections::HashMap;

pub const SERVICE_NAME: &str = "ServiceName";
pub const FUNC_NAME: &str = "FuncName";
pub const CODEC: &str = "Codec";
pub const ERROR: &str = "Error";
pub const META_PREFIX: &str = "Meta-";

/// Typed view of a wire message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub service_name: String,
    pub func_name: String,
    pub codec: String,
    /// Empty string means success. When set, `body` must be ignored.
    pub error: String,
    pub metadata: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Split a wire message into reserved fields and metadata.
pub fn parse(msg: WireMessage) -> Envelope {
    let mut envelope = Envelope {
        body: msg.body,
        ..Envelope::default()
    };

    for (key, value) in msg.header {
        match key.as_str() {
            SERVICE_NAME => envelope.service_name = value,
            FUNC_NAME => envelope.func_name = value,
            CODEC => envelope.codec = value,
            ERROR => envelope.error = value,
            _ => {
                let name = key.strip_prefix(META_PREFIX).unwrap_or(&key).to_string();
                envelope.metadata.insert(name, value);
            }
        }
    }

    envelope
}

/// Build a wire message from an envelope. All reserved keys are always set.
pub fn format(envelope: Envelope) -> WireMessage {
    let mut header = HashMap::with_capacity(envelope.metadata.len() + 4);
    header.insert(SERVICE_NAME.to_string(), envelope.service_name);
    header.insert(FUNC_NAME.to_string(), envelope.func_name);
    header.insert(CODEC.to_string(), envelope.codec);
    header.insert(ERROR.to_string(), envelope.error);
    for (key, value) in envelope.metadata {
        header.insert(format!("{}{}", META_PREFIX, key), value);
    }

    WireMessage::new(header, envelope.body)
}
