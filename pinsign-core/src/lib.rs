//! Pinsign library exports
//!
//! Builds per-customer trust manifests of TLS certificate pins, signs them
//! with a per-customer self-signed trust anchor and verifies the result.

pub mod anchor;
pub mod certificate;
pub mod config;
pub mod crypto;
pub mod error;
pub mod manifest;
pub mod pinning;
pub mod pipeline;
pub mod signer;

pub use anchor::{EnsuredAnchor, TrustAnchor, TrustAnchorManager};
pub use certificate::{CertificateFetcher, CertificateIdentity, FetchError, TlsFetcher};
pub use config::{CustomerPaths, SignerConfig};
pub use crypto::{CryptoBackend, CryptoError, OpensslBackend};
pub use error::{ErrorCategory, SignerError};
pub use manifest::{HostRecord, Manifest, TimestampMode};
pub use pinning::{PinPolicy, PinSet, PinVerdict};
pub use pipeline::{CustomerOutcome, CustomerStatus, Pipeline, RunOptions, RunReport};
pub use signer::{ManifestSigner, SignedArtifact};
