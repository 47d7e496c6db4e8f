//! Inbound TLS for the HTTPS listener

use anyhow::{anyhow, Context, Result};
use gateway_api::TlsFilesConfig;
use rustls::crypto::ring;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// Build a rustls server configuration from PEM-encoded certificate and key
pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    debug!("Creating TLS configuration from PEM data");

    let mut cert_reader = BufReader::new(cert_pem);
    let cert_chain = certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("Failed to parse certificates: {}", e))?;

    if cert_chain.is_empty() {
        return Err(anyhow!("No certificates found in PEM data"));
    }
    debug!("Loaded {} certificate(s)", cert_chain.len());

    let mut key_reader = BufReader::new(key_pem);
    let key = private_key(&mut key_reader)
        .map_err(|e| anyhow!("Failed to parse private key: {}", e))?
        .ok_or_else(|| anyhow!("No private key found in PEM data"))?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow!("Failed to select TLS versions: {}", e))?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| anyhow!("Failed to create TLS config: {}", e))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Load the certificate and key files named by the HTTPS listener
pub fn tls_acceptor(files: &TlsFilesConfig) -> Result<TlsAcceptor> {
    let cert_pem = std::fs::read(&files.cert_path)
        .with_context(|| format!("Failed to read certificate {}", files.cert_path))?;
    let key_pem = std::fs::read(&files.key_path)
        .with_context(|| format!("Failed to read private key {}", files.key_path))?;

    let config = server_config_from_pem(&cert_pem, &key_pem)?;
    info!("TLS configuration loaded from {}", files.cert_path);
    Ok(TlsAcceptor::from(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_pem_rejected() {
        let err = server_config_from_pem(b"", b"").unwrap_err();
        assert!(err.to_string().contains("No certificates"));
    }

    #[test]
    fn test_missing_key_rejected() {
        let cert = b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        let err = server_config_from_pem(cert, b"").unwrap_err();
        assert!(err.to_string().contains("No private key"));
    }

    #[test]
    fn test_missing_files_reported() {
        let mut key = tempfile::NamedTempFile::new().unwrap();
        key.write_all(b"").unwrap();
        let files = TlsFilesConfig {
            cert_path: "/nonexistent/cert.pem".to_string(),
            key_path: key.path().display().to_string(),
        };
        let err = tls_acceptor(&files).err().unwrap();
        assert!(err.to_string().contains("/nonexistent/cert.pem"));
    }
}
