//! Relying-party CLI commands
//!
//! Verify a signed manifest against its trust anchor, and check what a live
//! endpoint presents against the verified pins.

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;

use pinsign_core::certificate::{self, CertificateFetcher, CertificateIdentity, TlsFetcher};
use pinsign_core::config::SignerConfig;
use pinsign_core::manifest::{DomainEntry, Manifest};
use pinsign_core::pinning::{PinPolicy, PinSet, PinVerdict};
use pinsign_core::signer::ManifestSigner;

/// Exit code when the endpoint is not in the manifest
const EXIT_UNKNOWN_HOST: i32 = 2;

/// Which signed manifest to load
#[derive(Args, Debug)]
pub struct ManifestSource {
    /// Use the published artifact and certificate of this customer
    #[clap(
        short = 'c',
        long,
        conflicts_with_all = ["artifact", "anchor"],
        required_unless_present = "artifact"
    )]
    customer: Option<String>,

    /// Signed manifest file
    #[clap(long, requires = "anchor")]
    artifact: Option<PathBuf>,

    /// Trust anchor certificate, PEM or DER
    #[clap(long, requires = "artifact")]
    anchor: Option<PathBuf>,
}

impl ManifestSource {
    fn resolve(&self, config: &SignerConfig) -> Result<(PathBuf, PathBuf)> {
        match (&self.customer, &self.artifact, &self.anchor) {
            (Some(customer), _, _) => {
                let paths = config.customer_paths(customer)?;
                Ok((paths.signed_manifest, paths.certificate_pem))
            }
            (None, Some(artifact), Some(anchor)) => Ok((artifact.clone(), anchor.clone())),
            _ => bail!("Either --customer or both --artifact and --anchor are required"),
        }
    }

    /// Load and verify the manifest; `Err` means it must not be trusted
    fn load_verified(&self, config: &SignerConfig) -> Result<(PathBuf, Manifest)> {
        let (artifact, anchor) = self.resolve(config)?;
        let anchor_cert = std::fs::read(&anchor)
            .with_context(|| format!("Failed to read trust anchor {}", anchor.display()))?;

        let manifest = ManifestSigner::default().open_file(&artifact, &anchor_cert)?;

        if let Some(customer) = &self.customer {
            if &manifest.customer != customer {
                bail!(
                    "Manifest {} was issued for {:?}, not {:?}",
                    artifact.display(),
                    manifest.customer,
                    customer
                );
            }
        }
        Ok((artifact, manifest))
    }
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    #[clap(flatten)]
    source: ManifestSource,
}

impl VerifyArgs {
    /// Print the verified manifest on stdout; status goes to stderr
    pub async fn execute(&self, config: &SignerConfig) -> Result<()> {
        let (artifact, manifest) = match self.source.load_verified(config) {
            Ok(loaded) => loaded,
            Err(e) => {
                eprintln!("❌ Signed manifest does NOT verify");
                eprintln!("   {e:#}");
                std::process::exit(1);
            }
        };

        eprintln!("✅ {} verifies against its trust anchor", artifact.display());
        eprintln!("   Customer:  {}", manifest.customer);
        eprintln!("   Hosts:     {}", manifest.hashes.len());
        match manifest.issued_at() {
            Some(issued) => eprintln!("   Timestamp: {} ({})", manifest.timestamp, issued.to_rfc3339()),
            None => eprintln!("   Timestamp: {}", manifest.timestamp),
        }

        println!("{}", serde_json::to_string_pretty(&manifest)?);
        Ok(())
    }
}

/// Pin policy flag values
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PolicyArg {
    /// Match the certificate fingerprint
    Certificate,
    /// Match the public key only
    PublicKey,
}

impl From<PolicyArg> for PinPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Certificate => PinPolicy::Certificate,
            PolicyArg::PublicKey => PinPolicy::PublicKey,
        }
    }
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[clap(flatten)]
    source: ManifestSource,

    /// What must match
    #[clap(long, value_enum, default_value = "certificate")]
    policy: PolicyArg,

    /// Endpoint to check, as hostname:port
    #[clap(value_name = "HOST:PORT")]
    endpoint: DomainEntry,
}

#[derive(Serialize)]
struct CheckReport<'a> {
    endpoint: String,
    customer: &'a str,
    policy: PinPolicy,
    verdict: PinVerdict,
    presented: &'a CertificateIdentity,
}

impl CheckArgs {
    /// Exit 0 on a match, 1 on a mismatch, 2 when the host is not pinned
    pub async fn execute(&self, config: &SignerConfig, json: bool) -> Result<()> {
        let (_, manifest) = self
            .source
            .load_verified(config)
            .context("Refusing to check against an unverified manifest")?;
        let pins = PinSet::from_manifest(manifest);

        let fetcher = TlsFetcher::new(config.fetch.timeout())
            .context("Failed to set up the TLS client")?;
        let der = fetcher
            .fetch(&self.endpoint.hostname, self.endpoint.port)
            .await
            .with_context(|| format!("Failed to fetch certificate from {}", self.endpoint))?;
        let presented = certificate::extract(&der)
            .with_context(|| format!("{} presented a malformed certificate", self.endpoint))?;

        let policy = PinPolicy::from(self.policy);
        let verdict = pins.check(
            &self.endpoint.hostname,
            self.endpoint.port,
            &presented,
            policy,
        );

        if json {
            let report = CheckReport {
                endpoint: self.endpoint.to_string(),
                customer: &pins.manifest().customer,
                policy,
                verdict,
                presented: &presented,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            match verdict {
                PinVerdict::Match => println!("✅ {} matches its pin", self.endpoint),
                PinVerdict::Mismatch => {
                    println!("❌ {} does NOT match its pin", self.endpoint);
                    println!("   Presented fingerprint: {}", presented.fingerprint);
                }
                PinVerdict::UnknownHost => println!(
                    "❓ {} is not pinned for {}",
                    self.endpoint,
                    pins.manifest().customer
                ),
            }
        }

        match verdict {
            PinVerdict::Match => Ok(()),
            PinVerdict::Mismatch => std::process::exit(1),
            PinVerdict::UnknownHost => std::process::exit(EXIT_UNKNOWN_HOST),
        }
    }
}
