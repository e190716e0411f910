//! Manifest signing and verification
//!
//! Signatures are enveloping: the artifact carries the manifest bytes, so a
//! relying party needs nothing but the artifact and the trust anchor
//! certificate. Every artifact is verified from disk before it is accepted.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

use crate::anchor::TrustAnchor;
use crate::crypto::{self, CryptoBackend, CryptoError, OpensslBackend};
use crate::error::SignerError;
use crate::manifest::Manifest;

/// A signed manifest that passed self-verification
#[derive(Debug, Clone)]
pub struct SignedArtifact {
    pub path: PathBuf,
    pub size: usize,
}

/// Signs manifests with a customer's trust anchor
pub struct ManifestSigner {
    backend: Arc<dyn CryptoBackend>,
}

impl ManifestSigner {
    pub fn new(backend: Arc<dyn CryptoBackend>) -> Self {
        ManifestSigner { backend }
    }

    /// Sign `manifest` and publish it at `destination`
    ///
    /// The artifact is written next to the destination, read back and
    /// verified against the anchor certificate. Only an artifact whose
    /// embedded content equals `manifest` is moved into place; anything else
    /// is deleted and reported as an integrity violation.
    pub fn sign(
        &self,
        manifest: &[u8],
        anchor: &TrustAnchor,
        destination: &Path,
    ) -> Result<SignedArtifact, SignerError> {
        let customer = anchor.customer();
        let artifact = self
            .backend
            .sign(manifest, anchor.certificate_der(), anchor.private_key_pem())
            .map_err(|source| SignerError::Signing {
                customer: customer.to_string(),
                source,
            })?;

        let staging = staging_path(destination);
        fs::write(&staging, &artifact).map_err(|source| {
            discard(&staging);
            SignerError::ArtifactWrite {
                path: staging.clone(),
                source,
            }
        })?;

        if let Err(source) = self.self_verify(&staging, manifest, anchor.certificate_der()) {
            discard(&staging);
            return Err(SignerError::IntegrityViolation {
                customer: customer.to_string(),
                path: destination.to_path_buf(),
                source,
            });
        }

        fs::rename(&staging, destination).map_err(|source| {
            discard(&staging);
            SignerError::ArtifactWrite {
                path: destination.to_path_buf(),
                source,
            }
        })?;

        debug!(
            "Signed {} bytes of manifest for {} into {}",
            manifest.len(),
            customer,
            destination.display()
        );
        Ok(SignedArtifact {
            path: destination.to_path_buf(),
            size: artifact.len(),
        })
    }

    /// Whether `artifact` verifies against `anchor_cert` (PEM or DER)
    pub fn verify(&self, artifact: &[u8], anchor_cert: &[u8]) -> bool {
        self.open(artifact, anchor_cert).is_ok()
    }

    /// Verify `artifact` and return the embedded manifest bytes
    pub fn open(&self, artifact: &[u8], anchor_cert: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let anchor_der = crypto::certificate_to_der(anchor_cert)?;
        self.backend.verify(artifact, &anchor_der)
    }

    /// Verify a signed manifest file and parse its content
    pub fn open_file(&self, artifact: &Path, anchor_cert: &[u8]) -> Result<Manifest, SignerError> {
        let bytes = fs::read(artifact).map_err(|source| SignerError::ArtifactRead {
            path: artifact.to_path_buf(),
            source,
        })?;
        let content =
            self.open(&bytes, anchor_cert)
                .map_err(|source| SignerError::VerificationFailed {
                    path: artifact.to_path_buf(),
                    source,
                })?;
        Manifest::from_bytes(&content).map_err(|source| SignerError::ManifestParse {
            path: artifact.to_path_buf(),
            source,
        })
    }

    fn self_verify(
        &self,
        staging: &Path,
        expected: &[u8],
        anchor_der: &[u8],
    ) -> Result<(), Option<CryptoError>> {
        let written = fs::read(staging).map_err(|e| {
            error!("Could not re-read {}: {}", staging.display(), e);
            None
        })?;
        let content = self.backend.verify(&written, anchor_der).map_err(Some)?;
        if content != expected {
            error!(
                "Embedded content of {} differs from the manifest that was signed",
                staging.display()
            );
            return Err(None);
        }
        Ok(())
    }
}

impl Default for ManifestSigner {
    fn default() -> Self {
        ManifestSigner::new(Arc::new(OpensslBackend::new()))
    }
}

/// Verify `artifact` against `anchor_cert` (PEM or DER) with the default backend
pub fn verify(artifact: &[u8], anchor_cert: &[u8]) -> bool {
    ManifestSigner::default().verify(artifact, anchor_cert)
}

fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!("Failed to delete unverified artifact {}: {}", path.display(), e);
        }
    }
}
