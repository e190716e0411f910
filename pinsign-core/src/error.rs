//! Signer error types with clear, actionable messages

use std::path::PathBuf;
use thiserror::Error;

use crate::certificate::fetcher::FetchError;
use crate::crypto::CryptoError;

/// How an error is handled by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Per-host network trouble; the host is skipped
    Transient,
    /// Bad or missing input for one customer; the customer is skipped
    Configuration,
    /// A freshly signed artifact failed self-verification
    Integrity,
    /// Directories, key generation or locking failed; the run stops
    Setup,
    /// A fetch failed for a reason other than resolution or connectivity
    Transport,
    /// Any other persistence problem
    Io,
    /// The operator asked the run to stop
    Interrupted,
}

/// Errors raised while building, signing or verifying manifests
#[derive(Error, Debug)]
pub enum SignerError {
    /// Customer identifier cannot be used as a file name
    #[error("Invalid customer identifier {customer:?}\n\nCustomer identifiers must be 1-128 characters of [A-Za-z0-9._-] and must not start with '.'")]
    InvalidCustomer { customer: String },

    /// No domain list exists for the customer
    #[error("Customer \"{customer}\" not found. Please create {}.", .path.display())]
    DomainListMissing { customer: String, path: PathBuf },

    /// Domain list exists but could not be read
    #[error("Failed to read domain list {}", .path.display())]
    DomainListRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cached manifest exists but could not be read
    #[error("Failed to read cached manifest {}", .path.display())]
    CacheRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cached manifest is corrupt or violates host record invariants
    #[error("Cached manifest {} is invalid: {reason}\n\nRe-fetch certificates with --force-update", .path.display())]
    CacheInvalid { path: PathBuf, reason: String },

    /// Cached manifest could not be written
    #[error("Failed to write cached manifest {}", .path.display())]
    CacheWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A host fetch failed with a non-transient transport error
    #[error("Failed to fetch certificate from {host}:{port}")]
    Fetch {
        host: String,
        port: u16,
        #[source]
        source: FetchError,
    },

    /// A fetched host produced no usable certificate identity
    #[error("Certificate presented by {host}:{port} is malformed")]
    MalformedCertificate {
        host: String,
        port: u16,
        #[source]
        source: CryptoError,
    },

    /// Output, data or certificate directory could not be created
    #[error("Failed to create directory {}", .path.display())]
    Setup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Trust anchor lock could not be acquired
    #[error("Failed to lock trust anchor for {customer} at {}", .path.display())]
    LockFailed {
        customer: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Key pair or certificate generation failed
    #[error("Failed to generate trust anchor for {customer}")]
    KeyGeneration {
        customer: String,
        #[source]
        source: CryptoError,
    },

    /// Private key exists but the matching certificate does not
    #[error("Trust anchor for {customer} is incomplete: private key exists but {} is missing\n\nRestore the certificate from backup. The key will not be regenerated because that would invalidate every distributed trust anchor.", .path.display())]
    AnchorIncomplete { customer: String, path: PathBuf },

    /// Trust anchor files could not be read or parsed
    #[error("Failed to load trust anchor file {}", .path.display())]
    AnchorRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Trust anchor files could not be written
    #[error("Failed to write trust anchor file {}", .path.display())]
    AnchorWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stored key or certificate is not valid key material
    #[error("Trust anchor for {customer} is unreadable")]
    AnchorCorrupt {
        customer: String,
        #[source]
        source: CryptoError,
    },

    /// Signature creation failed
    #[error("Failed to sign manifest for {customer}")]
    Signing {
        customer: String,
        #[source]
        source: CryptoError,
    },

    /// Freshly produced artifact did not verify against its trust anchor
    #[error("SECURITY ALERT: signed manifest for {customer} failed self-verification!\n\nThe unverified artifact was discarded and {} was left unchanged. Check the trust anchor files and the crypto library before re-running.", .path.display())]
    IntegrityViolation {
        customer: String,
        path: PathBuf,
        #[source]
        source: Option<CryptoError>,
    },

    /// Signed artifact could not be written
    #[error("Failed to write signed manifest {}", .path.display())]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Signed artifact could not be read
    #[error("Failed to read signed manifest {}", .path.display())]
    ArtifactRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Every host failed or the domain list had no usable entries
    #[error("No host certificates collected for {customer}; refusing to sign an empty manifest\n\nCheck {} and the reachability of the listed hosts.", .path.display())]
    NoHosts { customer: String, path: PathBuf },

    /// A signed manifest did not verify against the supplied trust anchor
    #[error("Signed manifest {} does not verify against the trust anchor", .path.display())]
    VerificationFailed {
        path: PathBuf,
        #[source]
        source: CryptoError,
    },

    /// Verified content is not a manifest
    #[error("Signed manifest {} does not contain a valid manifest", .path.display())]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Shutdown was requested before all hosts were fetched
    #[error("Interrupted before all hosts for {customer} were fetched")]
    Interrupted { customer: String },

    /// Manifest serialization failed
    #[error("Failed to serialize manifest")]
    Serialization {
        #[source]
        source: serde_json::Error,
    },

    /// Blocking task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),
}

impl SignerError {
    /// Classify the error for the pipeline's propagation policy
    pub fn category(&self) -> ErrorCategory {
        match self {
            SignerError::InvalidCustomer { .. }
            | SignerError::DomainListMissing { .. }
            | SignerError::DomainListRead { .. }
            | SignerError::CacheRead { .. }
            | SignerError::CacheInvalid { .. }
            | SignerError::AnchorIncomplete { .. }
            | SignerError::AnchorCorrupt { .. }
            | SignerError::NoHosts { .. } => ErrorCategory::Configuration,
            SignerError::Fetch { source, .. } if source.is_transient() => ErrorCategory::Transient,
            SignerError::Fetch { .. } | SignerError::MalformedCertificate { .. } => {
                ErrorCategory::Transport
            }
            SignerError::IntegrityViolation { .. } | SignerError::VerificationFailed { .. } => {
                ErrorCategory::Integrity
            }
            SignerError::Interrupted { .. } => ErrorCategory::Interrupted,
            SignerError::Setup { .. }
            | SignerError::LockFailed { .. }
            | SignerError::KeyGeneration { .. } => ErrorCategory::Setup,
            SignerError::CacheWrite { .. }
            | SignerError::AnchorRead { .. }
            | SignerError::AnchorWrite { .. }
            | SignerError::Signing { .. }
            | SignerError::ArtifactWrite { .. }
            | SignerError::ArtifactRead { .. }
            | SignerError::ManifestParse { .. }
            | SignerError::Serialization { .. }
            | SignerError::Task(_) => ErrorCategory::Io,
        }
    }

    /// Whether the error must stop the whole run
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Setup | ErrorCategory::Interrupted
        )
    }

    /// Log security-critical signer errors
    pub fn log_if_security_critical(&self) {
        match self {
            SignerError::IntegrityViolation { .. } | SignerError::AnchorIncomplete { .. } => {
                tracing::error!(target: "security", "TRUST ANCHOR INTEGRITY: {}", self);
            }
            _ => {}
        }
    }
}
