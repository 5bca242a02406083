//! TLS material for the TCP transport.
//!
//! All configs are built on the ring crypto provider. Servers either load a
//! PEM certificate chain and key from disk or generate a self-signed
//! certificate at startup. Clients either trust a given set of roots or skip
//! certificate verification entirely, which is what callers get when they
//! reach a TLS service without supplying their own configuration.

use crate::{DodoError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// A freshly generated self-signed certificate and the server config using it.
pub struct SelfSigned {
    pub certificate: CertificateDer<'static>,
    pub config: Arc<rustls::ServerConfig>,
}

/// Build a server config from an in-memory chain and key.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<rustls::ServerConfig>> {
    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Load a PEM certificate chain and private key from disk.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert_path)
        .map_err(|e| DodoError::Tls {
            message: format!("failed to read {}: {}", cert_path.display(), e),
        })?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| DodoError::Tls {
            message: format!("failed to parse certificates from {}: {}", cert_path.display(), e),
        })?;

    if certs.is_empty() {
        return Err(DodoError::Tls {
            message: format!("no certificates found in {}", cert_path.display()),
        });
    }

    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| DodoError::Tls {
        message: format!("failed to parse private key from {}: {}", key_path.display(), e),
    })?;

    server_config(certs, key)
}

/// Generate a self-signed certificate valid for the given host names or IPs.
pub fn self_signed(hosts: Vec<String>) -> Result<SelfSigned> {
    debug!("Generating self-signed certificate for {:?}", hosts);
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(hosts)?;
    let certificate = cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());
    let config = server_config(vec![certificate.clone()], key)?;
    Ok(SelfSigned {
        certificate,
        config,
    })
}

/// Host names a self-signed certificate should cover for a bind address.
///
/// An unspecified or missing host covers the loopback names.
pub fn certificate_hosts(bind: &str) -> Vec<String> {
    let host = match bind.parse::<SocketAddr>() {
        Ok(addr) if addr.ip().is_unspecified() => None,
        Ok(addr) => Some(addr.ip().to_string()),
        Err(_) => bind
            .rsplit_once(':')
            .map(|(host, _)| host)
            .filter(|host| !host.is_empty())
            .map(str::to_string),
    };

    match host {
        Some(host) => vec![host],
        None => vec!["localhost".to_string(), "127.0.0.1".to_string()],
    }
}

/// Client config trusting exactly the given roots.
pub fn client_config(roots: Vec<CertificateDer<'static>>) -> Result<Arc<rustls::ClientConfig>> {
    let mut store = rustls::RootCertStore::empty();
    for root in roots {
        store.add(root)?;
    }
    let config = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Client config that accepts any server certificate.
///
/// Handshake signatures are still checked; only the chain of trust and the
/// server name are not.
pub fn insecure_client_config() -> Result<Arc<rustls::ClientConfig>> {
    let provider = provider();
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Server name to present during the handshake for a `host:port` address.
pub fn server_name(address: &str) -> Result<ServerName<'static>> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(ServerName::IpAddress(addr.ip().into()));
    }

    let host = address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address)
        .trim_start_matches('[')
        .trim_end_matches(']');

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }

    ServerName::try_from(host.to_string()).map_err(|e| DodoError::Tls {
        message: format!("invalid server name {:?}: {}", host, e),
    })
}

#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_certificate_hosts() {
        assert_eq!(
            certificate_hosts("0.0.0.0:17312"),
            vec!["localhost".to_string(), "127.0.0.1".to_string()]
        );
        assert_eq!(certificate_hosts("10.1.2.3:80"), vec!["10.1.2.3".to_string()]);
        assert_eq!(certificate_hosts("rpc.internal:80"), vec!["rpc.internal".to_string()]);
        assert_eq!(certificate_hosts(":80").len(), 2);
    }

    #[test]
    fn test_server_name() {
        assert!(matches!(
            server_name("127.0.0.1:17312").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name("localhost:17312").unwrap(),
            ServerName::DnsName(_)
        ));
    }

    #[test]
    fn test_self_signed_and_client_configs() {
        let generated = self_signed(vec!["localhost".to_string()]).unwrap();
        assert!(!generated.certificate.is_empty());
        assert!(client_config(vec![generated.certificate]).is_ok());
        assert!(insecure_client_config().is_ok());
    }

    #[test]
    fn test_load_server_config_from_pem() {
        let tmp = TempDir::new().unwrap();
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = tmp.path().join("cert.pem");
        let key_path = tmp.path().join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

        assert!(load_server_config(&cert_path, &key_path).is_ok());
        assert!(load_server_config(&tmp.path().join("missing.pem"), &key_path).is_err());
    }
}
