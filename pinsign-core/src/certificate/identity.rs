//! Certificate identity extraction
//!
//! Uses SHA-256 over the full DER encoding for the fingerprint and the DER
//! SubjectPublicKeyInfo (base64) for the public key pin.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::CryptoError;

/// Pinning material for one certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateIdentity {
    /// Lowercase hex SHA-256 of the DER certificate, no separators
    pub fingerprint: String,
    /// Base64 DER SubjectPublicKeyInfo
    pub public_key: String,
}

/// Hash a DER certificate into its canonical fingerprint
pub fn fingerprint(cert_der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cert_der);
    hex::encode(hasher.finalize())
}

/// Canonicalize a fingerprint written as `AA:BB:..`, `sha256:aabb..` or with whitespace
pub fn normalize_fingerprint(value: &str) -> String {
    let trimmed = value.trim();
    let bare = trimmed
        .strip_prefix("sha256:")
        .or_else(|| trimmed.strip_prefix("SHA256:"))
        .unwrap_or(trimmed);
    bare.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Extract fingerprint and public key from a DER certificate
pub fn extract(cert_der: &[u8]) -> Result<CertificateIdentity, CryptoError> {
    let cert = X509::from_der(cert_der).map_err(|e| CryptoError::Malformed {
        what: "certificate",
        reason: e.to_string(),
    })?;
    identity_of(&cert, cert_der)
}

/// Extract fingerprint and public key from a PEM certificate
pub fn extract_pem(cert_pem: &[u8]) -> Result<CertificateIdentity, CryptoError> {
    let cert = X509::from_pem(cert_pem).map_err(|e| CryptoError::Malformed {
        what: "certificate",
        reason: e.to_string(),
    })?;
    let der = cert.to_der()?;
    identity_of(&cert, &der)
}

fn identity_of(cert: &X509, cert_der: &[u8]) -> Result<CertificateIdentity, CryptoError> {
    let spki = cert.public_key()?.public_key_to_der()?;
    Ok(CertificateIdentity {
        fingerprint: fingerprint(cert_der),
        public_key: STANDARD.encode(spki),
    })
}
