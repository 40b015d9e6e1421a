//! TLS connector setup
//!
//! Loads CA certificates from PEM files and builds the client-side
//! connector used by secure-listener scenarios. Handshake and cipher
//! negotiation are rustls's business, not this framework's.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use super::TransportError;

/// TLS settings for an actively connecting scenario
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsClientConfig {
    /// Path to the CA certificate file (PEM format) anchoring trust in
    /// the peer under test
    pub ca_cert_path: String,
    /// Name the peer's certificate must present (usually "localhost")
    pub server_name: String,
}

impl TlsClientConfig {
    pub(super) fn server_name(&self) -> Result<ServerName<'static>, TransportError> {
        ServerName::try_from(self.server_name.clone())
            .map_err(|e| TransportError::Tls(format!("invalid server name: {}", e)))
    }
}

/// Load CA certificates from a PEM file into a root store
fn load_ca_certs(path: &str) -> Result<RootCertStore, TransportError> {
    let file = File::open(path).map_err(|e| {
        TransportError::Tls(format!("failed to open CA certificate {}: {}", path, e))
    })?;
    let reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates found in {}",
            path
        )));
    }

    let mut root_store = RootCertStore::empty();
    for cert in certs {
        root_store
            .add(cert)
            .map_err(|e| TransportError::Tls(format!("failed to add CA certificate: {}", e)))?;
    }

    Ok(root_store)
}

/// Build a TlsConnector trusting the configured CA
pub fn load_tls_connector(config: &TlsClientConfig) -> Result<TlsConnector, TransportError> {
    let root_store = load_ca_certs(&config.ca_cert_path)?;

    let client_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(client_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ca_file_is_reported() {
        let config = TlsClientConfig {
            ca_cert_path: "/nonexistent/ca.pem".to_string(),
            server_name: "localhost".to_string(),
        };
        match load_tls_connector(&config) {
            Err(TransportError::Tls(msg)) => assert!(msg.contains("/nonexistent/ca.pem")),
            other => panic!("expected TLS error, got {:?}", other.err().map(|e| e.to_string())),
        }
    }

    #[test]
    fn invalid_server_name_is_reported() {
        let config = TlsClientConfig {
            ca_cert_path: "ca.pem".to_string(),
            server_name: "not a hostname".to_string(),
        };
        assert!(config.server_name().is_err());
    }
}
