//! Per-customer signing pipeline
//!
//! For each customer: read the domain list, reuse the cached manifest or fetch
//! every host's certificate, build the manifest, make sure the trust anchor
//! exists, sign and self-verify. Customers are independent; one failing does
//! not stop the others. Setup failures and shutdown requests stop the run.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::anchor::TrustAnchorManager;
use crate::certificate::{self, CertificateFetcher, FetchError, TlsFetcher};
use crate::config::SignerConfig;
use crate::crypto::{CryptoBackend, OpensslBackend};
use crate::error::{ErrorCategory, SignerError};
use crate::manifest::domains::{self, DomainEntry};
use crate::manifest::{self, cache, HostRecord, TimestampMode};
use crate::signer::ManifestSigner;

/// Knobs for one run
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Ignore cached manifests and fetch every host again
    pub force_refresh: bool,
    pub timestamp_mode: TimestampMode,
}

/// Where the host records of a signed manifest came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestSource {
    Fetched,
    Cached,
}

/// A host left out of the manifest because it could not be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedHost {
    pub hostname: String,
    pub port: u16,
    pub reason: String,
}

/// Host records gathered for one customer
#[derive(Debug, Clone, Default)]
pub struct HostCollection {
    pub records: Vec<HostRecord>,
    pub skipped: Vec<SkippedHost>,
}

/// What happened to one customer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CustomerStatus {
    Signed {
        artifact: PathBuf,
        hosts: usize,
        skipped_hosts: Vec<SkippedHost>,
        anchor_created: bool,
        source: ManifestSource,
        timestamp: i64,
    },
    /// Nothing to do for this customer (no domain list)
    Skipped { reason: String },
    Failed {
        error: String,
        category: ErrorCategory,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomerOutcome {
    pub customer: String,
    #[serde(flatten)]
    pub status: CustomerStatus,
}

/// Outcomes of a run, in the order customers were given
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub outcomes: Vec<CustomerOutcome>,
}

impl RunReport {
    pub fn signed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, CustomerStatus::Signed { .. }))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, CustomerStatus::Failed { .. }))
            .count()
    }

    pub fn has_failures(&self) -> bool {
        self.failed_count() > 0
    }
}

/// Drives fetch, build, anchor and sign for a list of customers
pub struct Pipeline {
    config: SignerConfig,
    fetcher: Arc<dyn CertificateFetcher>,
    anchors: Arc<TrustAnchorManager>,
    signer: Arc<ManifestSigner>,
    shutdown: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(
        config: SignerConfig,
        fetcher: Arc<dyn CertificateFetcher>,
        backend: Arc<dyn CryptoBackend>,
    ) -> Self {
        let anchors = Arc::new(TrustAnchorManager::new(config.clone(), backend.clone()));
        let signer = Arc::new(ManifestSigner::new(backend));
        Pipeline {
            config,
            fetcher,
            anchors,
            signer,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pipeline with the rustls fetcher and the OpenSSL backend
    pub fn with_defaults(config: SignerConfig) -> Result<Self, rustls::Error> {
        let fetcher = TlsFetcher::new(config.fetch.timeout())?;
        Ok(Self::new(
            config,
            Arc::new(fetcher),
            Arc::new(OpensslBackend::new()),
        ))
    }

    pub fn config(&self) -> &SignerConfig {
        &self.config
    }

    /// Flag that stops new fetches and customers once set
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Create the output and data directories
    pub fn prepare(&self) -> Result<(), SignerError> {
        for dir in [&self.config.output_dir, &self.config.data_dir] {
            std::fs::create_dir_all(dir).map_err(|source| SignerError::Setup {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Process every customer in order
    ///
    /// Returns `Err` only for errors that stop the run; per-customer failures
    /// are recorded in the report.
    pub async fn run(
        &self,
        customers: &[String],
        options: &RunOptions,
    ) -> Result<RunReport, SignerError> {
        self.prepare()?;

        if options.timestamp_mode == TimestampMode::FarFutureTest {
            warn!("Far-future test timestamps enabled; do not distribute these manifests");
        }

        let mut report = RunReport::default();
        for customer in customers {
            if self.shutdown_requested() {
                return Err(SignerError::Interrupted {
                    customer: customer.clone(),
                });
            }

            info!("Processing customer {}", customer);
            let status = match self.process_customer(customer, options).await {
                Ok(status) => status,
                Err(e @ SignerError::DomainListMissing { .. }) => {
                    warn!("{}", e);
                    CustomerStatus::Skipped {
                        reason: e.to_string(),
                    }
                }
                Err(e) if e.is_fatal_for_run() => {
                    error!("Stopping run at customer {}: {}", customer, e);
                    return Err(e);
                }
                Err(e) => {
                    e.log_if_security_critical();
                    let message = describe(&e);
                    error!("Customer {} failed: {}", customer, message);
                    CustomerStatus::Failed {
                        error: message,
                        category: e.category(),
                    }
                }
            };

            report.outcomes.push(CustomerOutcome {
                customer: customer.clone(),
                status,
            });
        }

        Ok(report)
    }

    /// Build, sign and publish the manifest for one customer
    pub async fn process_customer(
        &self,
        customer: &str,
        options: &RunOptions,
    ) -> Result<CustomerStatus, SignerError> {
        let paths = self.config.customer_paths(customer)?;
        let entries = domains::load_domain_list(&paths.domain_file, customer)?;

        let cached = if options.force_refresh {
            None
        } else {
            cache::load_cached_hosts(&paths.manifest_cache)?
        };

        let (collection, source) = match cached {
            Some(records) => {
                info!(
                    "Using cached certificates for {} from {}",
                    customer,
                    paths.manifest_cache.display()
                );
                (
                    HostCollection {
                        records,
                        skipped: Vec::new(),
                    },
                    ManifestSource::Cached,
                )
            }
            None => (
                self.collect_host_records(customer, &entries).await?,
                ManifestSource::Fetched,
            ),
        };

        if collection.records.is_empty() {
            return Err(SignerError::NoHosts {
                customer: customer.to_string(),
                path: paths.domain_file.clone(),
            });
        }

        let manifest = manifest::build(customer, collection.records, options.timestamp_mode);
        if source == ManifestSource::Fetched {
            cache::save_cache(&paths.manifest_cache, &manifest)?;
        }
        let bytes = manifest.to_bytes()?;

        let anchors = self.anchors.clone();
        let owned_customer = customer.to_string();
        let ensured = tokio::task::spawn_blocking(move || anchors.ensure(&owned_customer))
            .await
            .map_err(|e| SignerError::Task(e.to_string()))??;
        let anchor_created = ensured.created;

        let signer = self.signer.clone();
        let destination = paths.signed_manifest.clone();
        let anchor = ensured.anchor;
        let artifact =
            tokio::task::spawn_blocking(move || signer.sign(&bytes, &anchor, &destination))
                .await
                .map_err(|e| SignerError::Task(e.to_string()))??;

        info!("Signed file here: {}", artifact.path.display());
        Ok(CustomerStatus::Signed {
            artifact: artifact.path,
            hosts: manifest.hashes.len(),
            skipped_hosts: collection.skipped,
            anchor_created,
            source,
            timestamp: manifest.timestamp,
        })
    }

    /// Fetch every entry concurrently, keeping the domain list order
    ///
    /// Resolution, connection and timeout failures skip the host. Any other
    /// failure fails the customer.
    pub async fn collect_host_records(
        &self,
        customer: &str,
        entries: &[DomainEntry],
    ) -> Result<HostCollection, SignerError> {
        let shutdown = self.shutdown.clone();
        let fetcher = self.fetcher.clone();

        let mut results: Vec<(usize, DomainEntry, Result<Vec<u8>, FetchError>)> =
            stream::iter(entries.iter().cloned().enumerate())
                .take_while(move |_| futures::future::ready(!shutdown.load(Ordering::SeqCst)))
                .map(|(index, entry)| {
                    let fetcher = fetcher.clone();
                    async move {
                        debug!("Loading SSL certificate from {}", entry);
                        let result = fetcher.fetch(&entry.hostname, entry.port).await;
                        (index, entry, result)
                    }
                })
                .buffer_unordered(self.config.fetch.concurrency())
                .collect()
                .await;

        if results.len() < entries.len() {
            return Err(SignerError::Interrupted {
                customer: customer.to_string(),
            });
        }
        results.sort_by_key(|(index, _, _)| *index);

        let mut collection = HostCollection::default();
        for (_, entry, result) in results {
            match result {
                Ok(der) => {
                    let identity = certificate::extract(&der).map_err(|source| {
                        SignerError::MalformedCertificate {
                            host: entry.hostname.clone(),
                            port: entry.port,
                            source,
                        }
                    })?;
                    collection
                        .records
                        .push(HostRecord::from_identity(&entry.hostname, entry.port, identity));
                }
                Err(e) if e.is_transient() => {
                    warn!("{}", e);
                    collection.skipped.push(SkippedHost {
                        hostname: entry.hostname,
                        port: entry.port,
                        reason: e.to_string(),
                    });
                }
                Err(source) => {
                    return Err(SignerError::Fetch {
                        host: entry.hostname,
                        port: entry.port,
                        source,
                    })
                }
            }
        }

        Ok(collection)
    }
}

/// Error message followed by its sources, `: `-separated
fn describe(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut cause = err.source();
    while let Some(inner) = cause {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        cause = inner.source();
    }
    message
}
