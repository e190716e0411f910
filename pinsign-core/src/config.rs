//! Signer configuration and per-customer path resolution.
//!
//! Every component receives a [`SignerConfig`] at construction; nothing reads
//! ambient global state. Defaults reproduce the historical directory layout
//! (`output/`, `data/`, `certs/`) so existing deployments keep working.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::SignerError;

/// Config file looked up in the working directory when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "pinsign.yml";

static CUSTOMER_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-][A-Za-z0-9._-]{0,127}$").expect("valid regex"));

/// Subject fields shared by every trust anchor (everything except the CN)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizationFields {
    pub country: String,
    pub state: String,
    pub locality: String,
    pub organization: String,
}

impl Default for OrganizationFields {
    fn default() -> Self {
        OrganizationFields {
            country: "DE".to_string(),
            state: "NRW".to_string(),
            locality: "Cologne".to_string(),
            organization: "grandcentrix".to_string(),
        }
    }
}

/// Endpoint fetch tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Upper bound on resolve + connect + handshake for one host
    pub timeout_secs: u64,
    /// Maximum number of hosts fetched concurrently for one customer
    pub max_concurrent: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            timeout_secs: 10,
            max_concurrent: 8,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrent.max(1)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    /// Public artifacts: trust anchor certificates and signed manifests
    pub output_dir: PathBuf,
    /// Inputs: domain lists and cached manifests
    pub data_dir: PathBuf,
    /// Private keys (owner-only)
    pub cert_dir: PathBuf,
    pub organization: OrganizationFields,
    pub fetch: FetchConfig,
}

impl Default for SignerConfig {
    fn default() -> Self {
        SignerConfig {
            output_dir: PathBuf::from("output"),
            data_dir: PathBuf::from("data"),
            cert_dir: PathBuf::from("certs"),
            organization: OrganizationFields::default(),
            fetch: FetchConfig::default(),
        }
    }
}

impl SignerConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: SignerConfig = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        debug!("Loaded signer configuration from {}", path.display());
        Ok(config)
    }

    /// Resolve configuration: explicit file, then `pinsign.yml` in `base_dir`, then defaults
    pub fn discover(explicit: Option<&Path>, base_dir: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let candidate = base_dir.join(DEFAULT_CONFIG_FILE);
        if candidate.is_file() {
            return Self::load(&candidate);
        }

        debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Configuration with all three directories placed under `root`
    pub fn rooted_at(root: &Path) -> Self {
        SignerConfig {
            output_dir: root.join("output"),
            data_dir: root.join("data"),
            cert_dir: root.join("certs"),
            ..Self::default()
        }
    }

    /// File locations for one customer, validating the identifier
    pub fn customer_paths(&self, customer: &str) -> Result<CustomerPaths, SignerError> {
        validate_customer(customer)?;
        Ok(CustomerPaths {
            customer: customer.to_string(),
            domain_file: self.data_dir.join(format!("{customer}.domains")),
            manifest_cache: self.data_dir.join(format!("{customer}.json")),
            private_key: self.cert_dir.join(format!("{customer}.key")),
            anchor_lock: self.cert_dir.join(format!("{customer}.lock")),
            certificate_der: self.output_dir.join(format!("{customer}.crt")),
            certificate_pem: self.output_dir.join(format!("{customer}.pem")),
            signed_manifest: self.output_dir.join(format!("{customer}.json.signed")),
        })
    }
}

/// Every file the pipeline reads or writes for one customer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerPaths {
    pub customer: String,
    /// `<data>/<customer>.domains`
    pub domain_file: PathBuf,
    /// `<data>/<customer>.json`
    pub manifest_cache: PathBuf,
    /// `<certs>/<customer>.key`
    pub private_key: PathBuf,
    /// `<certs>/<customer>.lock`
    pub anchor_lock: PathBuf,
    /// `<output>/<customer>.crt`
    pub certificate_der: PathBuf,
    /// `<output>/<customer>.pem`
    pub certificate_pem: PathBuf,
    /// `<output>/<customer>.json.signed`
    pub signed_manifest: PathBuf,
}

/// Check that a customer identifier is non-empty and filesystem-safe
pub fn validate_customer(customer: &str) -> Result<(), SignerError> {
    if CUSTOMER_ID.is_match(customer) {
        Ok(())
    } else {
        Err(SignerError::InvalidCustomer {
            customer: customer.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_legacy_layout() {
        let config = SignerConfig::default();
        assert_eq!(config.output_dir, PathBuf::from("output"));
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.cert_dir, PathBuf::from("certs"));
        assert_eq!(config.organization.country, "DE");
        assert_eq!(config.fetch.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_customer_paths() {
        let config = SignerConfig::default();
        let paths = config.customer_paths("acme").unwrap();
        assert_eq!(paths.domain_file, PathBuf::from("data/acme.domains"));
        assert_eq!(paths.manifest_cache, PathBuf::from("data/acme.json"));
        assert_eq!(paths.private_key, PathBuf::from("certs/acme.key"));
        assert_eq!(paths.certificate_der, PathBuf::from("output/acme.crt"));
        assert_eq!(paths.certificate_pem, PathBuf::from("output/acme.pem"));
        assert_eq!(
            paths.signed_manifest,
            PathBuf::from("output/acme.json.signed")
        );
    }

    #[test]
    fn test_customer_validation() {
        assert!(validate_customer("acme").is_ok());
        assert!(validate_customer("test_customer").is_ok());
        assert!(validate_customer("acme-2.eu").is_ok());

        assert!(validate_customer("").is_err());
        assert!(validate_customer(".hidden").is_err());
        assert!(validate_customer("../etc/passwd").is_err());
        assert!(validate_customer("a/b").is_err());
        assert!(validate_customer("with space").is_err());
        assert!(validate_customer(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_load_partial_yaml() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(
            &path,
            "output_dir: /srv/pins/out\norganization:\n  organization: Example Corp\nfetch:\n  max_concurrent: 2\n",
        )?;

        let config = SignerConfig::discover(None, dir.path())?;
        assert_eq!(config.output_dir, PathBuf::from("/srv/pins/out"));
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.organization.organization, "Example Corp");
        assert_eq!(config.organization.country, "DE");
        assert_eq!(config.fetch.max_concurrent, 2);
        assert_eq!(config.fetch.timeout_secs, 10);
        Ok(())
    }

    #[test]
    fn test_discover_without_file_uses_defaults() -> Result<()> {
        let dir = TempDir::new()?;
        let config = SignerConfig::discover(None, dir.path())?;
        assert_eq!(config, SignerConfig::default());
        Ok(())
    }
}
