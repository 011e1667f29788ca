//! Local TLS material for the server and its clients.
//!
//! QUIC always runs over TLS. For local use a small CA is generated next to a
//! server certificate it signs; clients trust the CA file.

use std::{
    fs,
    path::{Path, PathBuf},
};

use rcgen::{
    BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use tracing::info;

use crate::RpcError;

pub const CA_CERT_FILE: &str = "ca.pem";
pub const SERVER_CERT_FILE: &str = "server.pem";
pub const SERVER_KEY_FILE: &str = "server.key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSet {
    pub ca_cert_path: PathBuf,
    /// Server certificate followed by the CA certificate.
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CertificateSet {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            ca_cert_path: dir.join(CA_CERT_FILE),
            cert_path: dir.join(SERVER_CERT_FILE),
            key_path: dir.join(SERVER_KEY_FILE),
        }
    }

    fn exists(&self) -> bool {
        self.ca_cert_path.is_file() && self.cert_path.is_file() && self.key_path.is_file()
    }
}

/// Returns the certificates in `dir`, generating them first if any file is missing.
pub fn ensure_certificates(dir: &Path, server_name: &str) -> Result<CertificateSet, RpcError> {
    let set = CertificateSet::in_dir(dir);
    if set.exists() {
        return Ok(set);
    }
    generate_certificates(dir, server_name)
}

/// Writes a fresh CA and a server certificate valid for `server_name`,
/// `localhost` and `127.0.0.1`.
pub fn generate_certificates(dir: &Path, server_name: &str) -> Result<CertificateSet, RpcError> {
    fs::create_dir_all(dir)?;

    let ca_key = KeyPair::generate().map_err(tls_error)?;
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).map_err(tls_error)?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "greetnet local CA");
    let ca_cert = ca_params.self_signed(&ca_key).map_err(tls_error)?;

    let mut names = vec![server_name.to_string()];
    for default in ["localhost", "127.0.0.1"] {
        if !names.iter().any(|name| name == default) {
            names.push(default.to_string());
        }
    }
    let server_key = KeyPair::generate().map_err(tls_error)?;
    let mut server_params = CertificateParams::new(names).map_err(tls_error)?;
    server_params
        .distinguished_name
        .push(DnType::CommonName, server_name);
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .map_err(tls_error)?;

    let set = CertificateSet::in_dir(dir);
    fs::write(&set.ca_cert_path, ca_cert.pem())?;
    fs::write(&set.cert_path, format!("{}{}", server_cert.pem(), ca_cert.pem()))?;
    fs::write(&set.key_path, server_key.serialize_pem())?;

    info!(dir = %dir.display(), server_name, "generated TLS certificates");
    Ok(set)
}

fn tls_error(err: rcgen::Error) -> RpcError {
    RpcError::TlsError(err.to_string())
}
