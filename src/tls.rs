//! TLS server configuration from PEM files.

use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject};

use crate::error::{PreforkError, Result};

/// ALPN protocols offered to clients, most preferred first.
const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Build a server configuration from a PEM certificate chain and private key.
pub fn server_config_from_pem(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .and_then(|iter| iter.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| {
            PreforkError::Config(format!(
                "Failed to read certificates from {}: {}",
                cert_path.display(),
                e
            ))
        })?;
    if certs.is_empty() {
        return Err(PreforkError::Config(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }

    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| {
        PreforkError::Config(format!(
            "Failed to read private key from {}: {}",
            key_path.display(),
            e
        ))
    })?;

    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    Ok(Arc::new(config))
}
