//! Endpoint certificate fetcher
//!
//! Connects to `host:port`, completes a TLS handshake and returns the leaf
//! certificate the server presented. The manifest records what is presented,
//! so the chain, expiry and hostname are deliberately not validated. The
//! handshake signature is still checked, which proves the peer holds the
//! private key of the certificate we record.

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

/// Errors from a single certificate fetch
#[derive(Error, Debug)]
pub enum FetchError {
    /// Host name did not resolve
    #[error("Host not found: {host}:{port}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// No resolved address accepted the TCP connection
    #[error("Connection to {host}:{port} failed")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Resolve, connect and handshake did not finish in time
    #[error("Timed out after {seconds}s fetching certificate from {host}:{port}")]
    Timeout { host: String, port: u16, seconds: u64 },

    /// TLS handshake failed
    #[error("TLS handshake with {host}:{port} failed")]
    Handshake {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Handshake completed without a server certificate
    #[error("{host}:{port} presented no certificate")]
    NoPeerCertificate { host: String, port: u16 },

    /// Host name is not usable as a TLS server name
    #[error("Invalid TLS server name: {host}")]
    InvalidServerName { host: String },
}

impl FetchError {
    /// Resolution, connection and timeout failures only affect one host
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Resolve { .. } | FetchError::Connect { .. } | FetchError::Timeout { .. }
        )
    }
}

/// Retrieves the DER leaf certificate presented by a TLS endpoint
#[async_trait]
pub trait CertificateFetcher: Send + Sync {
    async fn fetch(&self, hostname: &str, port: u16) -> Result<Vec<u8>, FetchError>;
}

/// [`CertificateFetcher`] over tokio + rustls
#[derive(Clone)]
pub struct TlsFetcher {
    connector: TlsConnector,
    timeout: Duration,
}

impl TlsFetcher {
    /// Create a fetcher whose whole resolve/connect/handshake is bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self, rustls::Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(RecordingVerifier { provider }))
            .with_no_client_auth();

        Ok(TlsFetcher {
            connector: TlsConnector::from(Arc::new(config)),
            timeout,
        })
    }

    async fn fetch_leaf(&self, hostname: &str, port: u16) -> Result<Vec<u8>, FetchError> {
        let addrs: Vec<SocketAddr> = lookup_host((hostname, port))
            .await
            .map_err(|source| FetchError::Resolve {
                host: hostname.to_string(),
                port,
                source,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(FetchError::Resolve {
                host: hostname.to_string(),
                port,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
            });
        }

        let stream = connect_any(hostname, port, &addrs).await?;

        let server_name = ServerName::try_from(hostname.to_string()).map_err(|_| {
            FetchError::InvalidServerName {
                host: hostname.to_string(),
            }
        })?;

        let tls = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|source| FetchError::Handshake {
                host: hostname.to_string(),
                port,
                source,
            })?;

        let (_, connection) = tls.get_ref();
        let leaf = connection
            .peer_certificates()
            .and_then(|chain| chain.first())
            .ok_or_else(|| FetchError::NoPeerCertificate {
                host: hostname.to_string(),
                port,
            })?;

        debug!("Fetched {} byte certificate from {}:{}", leaf.len(), hostname, port);
        Ok(leaf.as_ref().to_vec())
    }
}

#[async_trait]
impl CertificateFetcher for TlsFetcher {
    async fn fetch(&self, hostname: &str, port: u16) -> Result<Vec<u8>, FetchError> {
        match tokio::time::timeout(self.timeout, self.fetch_leaf(hostname, port)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                host: hostname.to_string(),
                port,
                seconds: self.timeout.as_secs(),
            }),
        }
    }
}

/// Try each resolved address in order, keeping the last connect error
async fn connect_any(
    hostname: &str,
    port: u16,
    addrs: &[SocketAddr],
) -> Result<TcpStream, FetchError> {
    let mut last_error = None;
    for addr in addrs {
        trace!("Connecting to {} ({})", hostname, addr);
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(FetchError::Connect {
        host: hostname.to_string(),
        port,
        source: last_error.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "no address reachable")
        }),
    })
}

/// Accepts whatever certificate the server presents.
///
/// Handshake signatures are verified with the provider's algorithms so the
/// server must own the key it presents.
#[derive(Debug)]
struct RecordingVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
