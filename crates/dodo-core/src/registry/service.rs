//! Service records and their canonical string form.
//!
//! ```text
//! rpc://127.0.0.1:17312/Hello?version=0.1.0&funcs=SayHello&codecs=json
//!     &transport=tcp&side=provider&tls=false&timestamp=1700000000&zone=a
//! ```
//!
//! Reserved parameters come first in fixed order, labels follow sorted by
//! key, and the whole string is percent-encoded once. Two records are equal
//! exactly when their canonical strings are.

use crate::{DodoError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

/// One discoverable instance of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    pub protocol: String,
    pub address: String,
    pub name: String,
    pub version: String,
    pub funcs: Vec<String>,
    pub codecs: Vec<String>,
    pub transport: String,
    pub side: String,
    pub tls: bool,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Service {
    /// Canonical, percent-encoded form.
    pub fn format(&self) -> String {
        let mut raw = format!(
            "{}://{}/{}?version={}&funcs={}&codecs={}&transport={}&side={}&tls={}&timestamp={}",
            self.protocol,
            self.address,
            self.name,
            self.version,
            self.funcs.join(","),
            self.codecs.join(","),
            self.transport,
            self.side,
            self.tls,
            self.timestamp,
        );
        for (key, value) in &self.labels {
            let _ = write!(raw, "&{}={}", key, value);
        }
        urlencoding::encode(&raw).into_owned()
    }

    /// Parse and validate a canonical string.
    pub fn parse(encoded: &str) -> Result<Self> {
        let raw = urlencoding::decode(encoded).map_err(|e| invalid(format!("bad encoding: {}", e)))?;
        let url = url::Url::parse(&raw).map_err(|e| invalid(format!("bad url: {}", e)))?;

        let mut service = Service {
            protocol: url.scheme().to_string(),
            ..Service::default()
        };

        service.address = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) if !host.is_empty() => format!("{}:{}", host, port),
            (Some(host), None) if !host.is_empty() => host.to_string(),
            _ => return Err(invalid("address is empty")),
        };
        service.name = url.path().trim_matches('/').to_string();
        if service.name.is_empty() {
            return Err(invalid("service name is empty"));
        }

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "version" => service.version = value.into_owned(),
                "funcs" => service.funcs = split_list(&value),
                "codecs" => service.codecs = split_list(&value),
                "transport" => service.transport = value.into_owned(),
                "side" => service.side = value.into_owned(),
                "tls" => {
                    service.tls = value
                        .parse()
                        .map_err(|_| invalid(format!("tls is not a boolean: {}", value)))?
                }
                "timestamp" => {
                    service.timestamp = value
                        .parse()
                        .map_err(|_| invalid(format!("timestamp is not an integer: {}", value)))?
                }
                _ => {
                    service
                        .labels
                        .entry(key.into_owned())
                        .or_insert_with(|| value.into_owned());
                }
            }
        }

        service.validate()?;
        Ok(service)
    }

    /// Check the fields every registered record must carry.
    pub fn validate(&self) -> Result<()> {
        if self.protocol.is_empty() {
            return Err(invalid("protocol is empty"));
        }
        if self.address.is_empty() {
            return Err(invalid("address is empty"));
        }
        if self.name.is_empty() {
            return Err(invalid("service name is empty"));
        }
        if self.codecs.is_empty() {
            return Err(invalid("codec is empty"));
        }
        if self.funcs.is_empty() {
            return Err(invalid("funcs is empty"));
        }
        if self.side.is_empty() {
            return Err(invalid("side is empty"));
        }
        if self.version.is_empty() {
            return Err(invalid("version is empty"));
        }
        if self.timestamp == 0 {
            return Err(invalid("timestamp invalid"));
        }
        Ok(())
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.format() == other.format()
    }
}

impl Eq for Service {}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}/{}", self.protocol, self.address, self.name)
    }
}

/// Whether `service` is in `services`.
pub fn contains(services: &[Service], service: &Service) -> bool {
    let key = service.format();
    services.iter().any(|s| s.format() == key)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn invalid(message: impl Into<String>) -> DodoError {
    DodoError::InvalidService {
        message: message.into(),
    }
}
