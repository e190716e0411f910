//! Relying-party side of a verified manifest
//!
//! Given a manifest that already verified against its trust anchor, decide
//! whether a certificate presented by a host matches the pins. Hosts pin
//! either the whole certificate (fingerprint) or only its public key, which
//! survives certificate renewal with the same key.

use serde::{Deserialize, Serialize};

use crate::certificate::{normalize_fingerprint, CertificateIdentity};
use crate::manifest::Manifest;

/// What part of the presented certificate must match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PinPolicy {
    /// SHA-256 fingerprint of the full certificate
    #[default]
    Certificate,
    /// DER SubjectPublicKeyInfo
    PublicKey,
}

/// Outcome of checking a presented certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PinVerdict {
    /// A pin for the host matches
    Match,
    /// The host is pinned but nothing matches
    Mismatch,
    /// The manifest has no pins for this host and port
    UnknownHost,
}

impl PinVerdict {
    pub fn is_match(self) -> bool {
        self == PinVerdict::Match
    }
}

/// Pins from a verified manifest
#[derive(Debug, Clone)]
pub struct PinSet {
    manifest: Manifest,
}

impl PinSet {
    pub fn from_manifest(manifest: Manifest) -> Self {
        PinSet { manifest }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Check the certificate `presented` by `hostname:port`
    pub fn check(
        &self,
        hostname: &str,
        port: u16,
        presented: &CertificateIdentity,
        policy: PinPolicy,
    ) -> PinVerdict {
        let Some(record) = self.manifest.host(hostname, port) else {
            return PinVerdict::UnknownHost;
        };

        let matched = match policy {
            PinPolicy::Certificate => {
                let presented = normalize_fingerprint(&presented.fingerprint);
                record
                    .fingerprints
                    .iter()
                    .any(|pinned| normalize_fingerprint(pinned) == presented)
            }
            PinPolicy::PublicKey => record
                .public_keys
                .iter()
                .any(|pinned| pinned.trim() == presented.public_key.trim()),
        };

        if matched {
            PinVerdict::Match
        } else {
            PinVerdict::Mismatch
        }
    }
}
