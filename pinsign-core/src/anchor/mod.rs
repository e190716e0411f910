//! Per-customer trust anchors
//!
//! A trust anchor is a self-signed RSA certificate relying parties embed to
//! verify signed manifests. It is created once and then reused for as long as
//! the private key exists; regenerating it would orphan every copy already
//! distributed, so nothing here ever replaces an existing key.

pub mod lock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{CustomerPaths, SignerConfig};
use crate::crypto::{self, CryptoBackend, SubjectFields};
use crate::error::SignerError;

pub use lock::AnchorLock;

/// RSA modulus size for trust anchor keys
pub const ANCHOR_KEY_BITS: u32 = 4096;

/// Trust anchor validity, roughly twenty years
pub const ANCHOR_VALIDITY_DAYS: u32 = 7300;

/// A customer's signing identity
#[derive(Clone)]
pub struct TrustAnchor {
    customer: String,
    certificate_der: Vec<u8>,
    certificate_pem: Vec<u8>,
    private_key_pem: Vec<u8>,
    certificate_path: PathBuf,
}

impl TrustAnchor {
    pub fn customer(&self) -> &str {
        &self.customer
    }

    /// The certificate relying parties pin, DER encoded
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn certificate_pem(&self) -> &[u8] {
        &self.certificate_pem
    }

    /// Base64 of the DER certificate, as printed in the operator banner
    pub fn certificate_base64(&self) -> String {
        STANDARD.encode(&self.certificate_der)
    }

    /// Where the PEM certificate is published
    pub fn certificate_path(&self) -> &Path {
        &self.certificate_path
    }

    pub(crate) fn private_key_pem(&self) -> &[u8] {
        &self.private_key_pem
    }
}

impl fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustAnchor")
            .field("customer", &self.customer)
            .field("certificate_path", &self.certificate_path)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// Result of [`TrustAnchorManager::ensure`]
#[derive(Debug, Clone)]
pub struct EnsuredAnchor {
    pub anchor: TrustAnchor,
    /// True when this call generated the anchor
    pub created: bool,
}

/// Creates trust anchors on first use and loads them afterwards
pub struct TrustAnchorManager {
    config: SignerConfig,
    backend: Arc<dyn CryptoBackend>,
}

impl TrustAnchorManager {
    pub fn new(config: SignerConfig, backend: Arc<dyn CryptoBackend>) -> Self {
        TrustAnchorManager { config, backend }
    }

    /// Return the customer's anchor, generating it if no private key exists yet
    ///
    /// Runs under an exclusive lock on `<cert_dir>/<customer>.lock`, so
    /// concurrent invocations for the same customer produce exactly one key.
    pub fn ensure(&self, customer: &str) -> Result<EnsuredAnchor, SignerError> {
        let paths = self.config.customer_paths(customer)?;
        self.prepare_directories()?;

        let _lock = AnchorLock::acquire(&paths.anchor_lock).map_err(|source| {
            SignerError::LockFailed {
                customer: customer.to_string(),
                path: paths.anchor_lock.clone(),
                source,
            }
        })?;

        if paths.private_key.exists() {
            debug!("Reusing trust anchor key {}", paths.private_key.display());
            let anchor = self.load_existing(&paths)?;
            return Ok(EnsuredAnchor {
                anchor,
                created: false,
            });
        }

        let anchor = self.generate(&paths)?;
        announce_new_anchor(&anchor, &paths);
        Ok(EnsuredAnchor {
            anchor,
            created: true,
        })
    }

    /// Load an existing anchor without ever creating one
    pub fn load(&self, customer: &str) -> Result<TrustAnchor, SignerError> {
        let paths = self.config.customer_paths(customer)?;
        self.load_existing(&paths)
    }

    fn prepare_directories(&self) -> Result<(), SignerError> {
        create_private_dir(&self.config.cert_dir)?;
        fs::create_dir_all(&self.config.output_dir).map_err(|source| SignerError::Setup {
            path: self.config.output_dir.clone(),
            source,
        })
    }

    fn load_existing(&self, paths: &CustomerPaths) -> Result<TrustAnchor, SignerError> {
        let customer = paths.customer.as_str();

        let private_key_pem = fs::read(&paths.private_key).map_err(|source| {
            SignerError::AnchorRead {
                path: paths.private_key.clone(),
                source,
            }
        })?;

        if !paths.certificate_pem.exists() {
            return Err(SignerError::AnchorIncomplete {
                customer: customer.to_string(),
                path: paths.certificate_pem.clone(),
            });
        }
        let certificate_pem = fs::read(&paths.certificate_pem).map_err(|source| {
            SignerError::AnchorRead {
                path: paths.certificate_pem.clone(),
                source,
            }
        })?;
        let certificate_der = crypto::certificate_to_der(&certificate_pem).map_err(|source| {
            SignerError::AnchorCorrupt {
                customer: customer.to_string(),
                source,
            }
        })?;

        Ok(TrustAnchor {
            customer: customer.to_string(),
            certificate_der,
            certificate_pem,
            private_key_pem,
            certificate_path: paths.certificate_pem.clone(),
        })
    }

    fn generate(&self, paths: &CustomerPaths) -> Result<TrustAnchor, SignerError> {
        let customer = paths.customer.as_str();
        info!(
            "Generating {}-bit trust anchor for {}, this may take a while",
            ANCHOR_KEY_BITS, customer
        );

        let key_generation = |source| SignerError::KeyGeneration {
            customer: customer.to_string(),
            source,
        };
        let private_key_pem = self
            .backend
            .generate_keypair(ANCHOR_KEY_BITS)
            .map_err(key_generation)?;
        let subject = SubjectFields::for_customer(&self.config.organization, customer);
        let certificate_der = self
            .backend
            .self_sign_certificate(&private_key_pem, &subject, ANCHOR_VALIDITY_DAYS)
            .map_err(key_generation)?;
        let certificate_pem =
            crypto::certificate_der_to_pem(&certificate_der).map_err(key_generation)?;

        for orphan in [&paths.certificate_der, &paths.certificate_pem] {
            if orphan.exists() {
                warn!(
                    target: "security",
                    "Replacing certificate {} which has no matching private key",
                    orphan.display()
                );
            }
        }

        // Certificates first: the key is the marker for a complete anchor
        write_atomic(&paths.certificate_der, &certificate_der, 0o644)?;
        write_atomic(&paths.certificate_pem, &certificate_pem, 0o644)?;
        write_atomic(&paths.private_key, &private_key_pem, 0o600)?;

        Ok(TrustAnchor {
            customer: customer.to_string(),
            certificate_der,
            certificate_pem,
            private_key_pem,
            certificate_path: paths.certificate_pem.clone(),
        })
    }
}

fn create_private_dir(path: &Path) -> Result<(), SignerError> {
    if path.is_dir() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path).map_err(|source| SignerError::Setup {
        path: path.to_path_buf(),
        source,
    })
}

/// Write through a sibling temp file and rename into place
fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), SignerError> {
    let write_error = |source| SignerError::AnchorWrite {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let result = options.open(&tmp_path).and_then(|mut file| {
        file.write_all(contents)?;
        file.sync_all()
    });
    if let Err(source) = result.and_then(|()| fs::rename(&tmp_path, path)) {
        let _ = fs::remove_file(&tmp_path);
        return Err(write_error(source));
    }
    Ok(())
}

fn announce_new_anchor(anchor: &TrustAnchor, paths: &CustomerPaths) {
    warn!(
        target: "security",
        customer = %anchor.customer(),
        certificate = %paths.certificate_pem.display(),
        "Generated new trust anchor; back it up and distribute it to relying parties"
    );

    if let Err(e) = write_banner(&mut io::stderr().lock(), anchor, paths) {
        warn!("Failed to print the trust anchor banner: {}", e);
    }
}

/// Operator banner carrying the new certificate
fn write_banner(
    out: &mut impl Write,
    anchor: &TrustAnchor,
    paths: &CustomerPaths,
) -> io::Result<()> {
    let rule = "=".repeat(72);
    writeln!(out, "{rule}")?;
    writeln!(out, "PLEASE BACKUP THIS, SINCE IT IS THE NOW VALID TRUST ANCHOR")?;
    writeln!(out, "Customer:    {}", anchor.customer())?;
    writeln!(out, "Certificate: {}", paths.certificate_pem.display())?;
    writeln!(out, "Private key: {}", paths.private_key.display())?;
    writeln!(out, "{rule}")?;
    writeln!(out, "{}", anchor.certificate_base64())?;
    writeln!(out, "{rule}")?;
    out.flush()
}
