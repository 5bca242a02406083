//! Candidate filters.
//!
//! A filter narrows a candidate list. Filters compose by running one after
//! another; each is a pure function of its input.

use crate::client::Client;
use crate::registry::Service;
use std::collections::HashSet;
use std::sync::Arc;

pub type Filter = Arc<dyn Fn(Vec<Service>) -> Vec<Service> + Send + Sync>;

/// Keep services whose label `key` equals `value`.
pub fn filter_label(key: impl Into<String>, value: impl Into<String>) -> Filter {
    let key = key.into();
    let value = value.into();
    Arc::new(move |services: Vec<Service>| -> Vec<Service> {
        services
            .into_iter()
            .filter(|s| s.labels.get(&key) == Some(&value))
            .collect()
    })
}

/// Keep services with exactly this version.
pub fn filter_version(version: impl Into<String>) -> Filter {
    let version = version.into();
    Arc::new(move |services: Vec<Service>| -> Vec<Service> {
        services
            .into_iter()
            .filter(|s| s.version == version)
            .collect()
    })
}

/// Keep services that serve TLS.
pub fn filter_tls() -> Filter {
    Arc::new(|services: Vec<Service>| -> Vec<Service> {
        services.into_iter().filter(|s| s.tls).collect()
    })
}

/// Keep services some client can talk to, without duplicates.
///
/// A client fits a service when protocol and transport match and they share
/// at least one codec.
pub fn filter_client(clients: Vec<Arc<dyn Client>>) -> Filter {
    Arc::new(move |services: Vec<Service>| -> Vec<Service> {
        let mut seen = HashSet::new();
        services
            .into_iter()
            .filter(|s| clients.iter().any(|c| compatible(c.as_ref(), s)))
            .filter(|s| seen.insert(s.format()))
            .collect()
    })
}

pub(crate) fn compatible(client: &dyn Client, service: &Service) -> bool {
    client.protocol() == service.protocol
        && client.transport_name() == service.transport
        && client
            .codec_names()
            .iter()
            .any(|codec| service.codecs.contains(codec))
}

/// Run filters in order.
pub fn apply(services: Vec<Service>, filters: &[Filter]) -> Vec<Service> {
    filters.iter().fold(services, |acc, filter| filter(acc))
}
