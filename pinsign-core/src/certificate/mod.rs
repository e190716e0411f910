//! Certificate retrieval and pinning identity
//!
//! - [`fetcher`]: pulls the leaf certificate a TLS endpoint presents
//! - [`identity`]: derives the fingerprint and public key pins from it

pub mod fetcher;
pub mod identity;

pub use fetcher::{CertificateFetcher, FetchError, TlsFetcher};
pub use identity::{extract, extract_pem, fingerprint, normalize_fingerprint, CertificateIdentity};
