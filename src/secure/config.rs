//! Module `config`
//!
//! Builders for the rustls configurations a `TlsRole` carries. Everything is
//! built on the `ring` provider with rustls' safe default protocol versions.

use log::info;
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::error::SecureError;

pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, SecureError> {
    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Loads a PEM certificate chain and private key.
pub fn server_config_from_pem(
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<ServerConfig>, SecureError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(SecureError::Certificate(format!(
            "No certificates in {}",
            cert_path.display()
        )));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| {
            SecureError::Certificate(format!("No private key in {}", key_path.display()))
        })?;
    info!(
        "Loaded {} certificates from {}",
        certs.len(),
        cert_path.display()
    );
    server_config(certs, key)
}

pub fn client_config(roots: RootCertStore) -> Result<Arc<ClientConfig>, SecureError> {
    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Trust store holding exactly `certs`.
pub fn root_store(
    certs: impl IntoIterator<Item = CertificateDer<'static>>,
) -> Result<RootCertStore, SecureError> {
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert)?;
    }
    Ok(roots)
}

pub fn server_name(name: &str) -> Result<ServerName<'static>, SecureError> {
    ServerName::try_from(name.to_string())
        .map_err(|e| SecureError::Certificate(format!("Invalid server name {}: {}", name, e)))
}
