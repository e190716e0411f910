//! Test helper functions for integration tests
//!
//! Shared across the test files using the tests/common/ pattern.

#![allow(dead_code)]

use async_trait::async_trait;
use openssl::x509::X509;
use pinsign_core::certificate::{CertificateFetcher, FetchError};
use pinsign_core::config::SignerConfig;
use pinsign_core::crypto::{CryptoBackend, CryptoError, OpensslBackend, SubjectFields};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

/// Initialize logging for tests (only once per test run)
static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_level(true),
            )
            .with(tracing_subscriber::filter::EnvFilter::from_default_env())
            .try_init();
    });
}

/// SHA-256 fingerprint of tests/fixtures/grandcentrix.pem
pub const FIXTURE_FINGERPRINT: &str =
    "a51c532d960cbbf63fdbfb3bf3e4b2816e2b902914a20a87541fdab72f7ae081";

pub fn fixture_pem() -> &'static [u8] {
    include_bytes!("../fixtures/grandcentrix.pem")
}

pub fn fixture_der() -> Vec<u8> {
    X509::from_pem(fixture_pem()).unwrap().to_der().unwrap()
}

/// Write `<data>/<customer>.domains`
pub fn write_domain_list(config: &SignerConfig, customer: &str, content: &str) {
    std::fs::create_dir_all(&config.data_dir).unwrap();
    std::fs::write(config.data_dir.join(format!("{customer}.domains")), content).unwrap();
}

pub fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

/// Serves canned certificates; unknown hosts are refused, `broken` hosts fail the handshake
#[derive(Default)]
pub struct MockFetcher {
    certificates: HashMap<(String, u16), Vec<u8>>,
    broken: Vec<(String, u16)>,
    calls: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_certificate(mut self, hostname: &str, port: u16, der: Vec<u8>) -> Self {
        self.certificates.insert((hostname.to_string(), port), der);
        self
    }

    pub fn with_broken_host(mut self, hostname: &str, port: u16) -> Self {
        self.broken.push((hostname.to_string(), port));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateFetcher for MockFetcher {
    async fn fetch(&self, hostname: &str, port: u16) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = (hostname.to_string(), port);

        if self.broken.contains(&key) {
            return Err(FetchError::NoPeerCertificate {
                host: hostname.to_string(),
                port,
            });
        }

        self.certificates
            .get(&key)
            .cloned()
            .ok_or_else(|| FetchError::Connect {
                host: hostname.to_string(),
                port,
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            })
    }
}

/// OpenSSL backend that generates 2048-bit keys whatever size is requested
pub struct FastBackend(pub OpensslBackend);

impl FastBackend {
    pub fn shared() -> Arc<dyn CryptoBackend> {
        Arc::new(FastBackend(OpensslBackend::new()))
    }
}

impl CryptoBackend for FastBackend {
    fn generate_keypair(&self, _bits: u32) -> Result<Vec<u8>, CryptoError> {
        self.0.generate_keypair(2048)
    }

    fn self_sign_certificate(
        &self,
        key_pem: &[u8],
        subject: &SubjectFields,
        validity_days: u32,
    ) -> Result<Vec<u8>, CryptoError> {
        self.0.self_sign_certificate(key_pem, subject, validity_days)
    }

    fn sign(&self, payload: &[u8], cert_der: &[u8], key_pem: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.0.sign(payload, cert_der, key_pem)
    }

    fn verify(&self, artifact: &[u8], anchor_der: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.0.verify(artifact, anchor_der)
    }
}
