//! Mutual-TLS certificate loading shared by the HTTPS and WebSocket
//! bridges. Both transports read the same certificate set from
//! `<home>/.keyop/certs/` (or an operator-configured override):
//! `ca.crt`, `keyop-server.{crt,key}`, `keyop-client.{crt,key}`.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::Path;
use std::sync::Arc;

use crate::error::KeyopError;

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, KeyopError> {
    let bytes = std::fs::read(path)
        .map_err(|e| KeyopError::Fatal(format!("reading cert {}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| KeyopError::Fatal(format!("parsing cert {}: {e}", path.display())))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, KeyopError> {
    let bytes = std::fs::read(path)
        .map_err(|e| KeyopError::Fatal(format!("reading key {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut bytes.as_slice())
        .map_err(|e| KeyopError::Fatal(format!("parsing key {}: {e}", path.display())))?
        .ok_or_else(|| KeyopError::Fatal(format!("no private key found in {}", path.display())))
}

fn load_root_store(ca_path: &Path) -> Result<RootCertStore, KeyopError> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        store
            .add(cert)
            .map_err(|e| KeyopError::Fatal(format!("adding CA cert: {e}")))?;
    }
    Ok(store)
}

/// Server-side TLS config requiring a client certificate signed by the
/// shared CA (`ClientAuth=RequireAndVerifyClientCert`).
pub fn server_config(cert_dir: &Path) -> Result<ServerConfig, KeyopError> {
    let roots = Arc::new(load_root_store(&cert_dir.join("ca.crt"))?);
    let verifier = WebPkiClientVerifier::builder(roots)
        .build()
        .map_err(|e| KeyopError::Fatal(format!("building client verifier: {e}")))?;
    let certs = load_certs(&cert_dir.join("keyop-server.crt"))?;
    let key = load_private_key(&cert_dir.join("keyop-server.key"))?;
    ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| KeyopError::Fatal(format!("building server TLS config: {e}")))
}

/// Client-side TLS config presenting this host's client certificate
/// and trusting only the shared CA.
pub fn client_config(cert_dir: &Path) -> Result<ClientConfig, KeyopError> {
    let roots = load_root_store(&cert_dir.join("ca.crt"))?;
    let certs = load_certs(&cert_dir.join("keyop-client.crt"))?;
    let key = load_private_key(&cert_dir.join("keyop-client.key"))?;
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| KeyopError::Fatal(format!("building client TLS config: {e}")))
}

/// Resolves the certificate directory: an explicit override, or
/// `<home>/.keyop/certs`.
pub fn resolve_cert_dir(
    override_dir: Option<&str>,
    home_dir: &Path,
) -> std::path::PathBuf {
    match override_dir {
        Some(dir) if !dir.is_empty() => std::path::PathBuf::from(dir),
        _ => home_dir.join(".keyop").join("certs"),
    }
}
