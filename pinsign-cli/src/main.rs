//! Pinsign - signed certificate-pinning manifests per customer
//!
//! Without a subcommand, signs the manifests of the given customers. `verify`
//! and `check` are the relying-party side.

use anyhow::{Context, Result};
use clap::{Args, Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use pinsign_core::config::SignerConfig;
use pinsign_core::manifest::TimestampMode;
use pinsign_core::pipeline::{CustomerStatus, Pipeline, RunOptions, RunReport};

mod verify_cli;

/// Exit code when no customer was given
const EXIT_NO_CUSTOMERS: i32 = 3;

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[clap(
    name = "pinsign",
    about = "Builds, signs and verifies per-customer certificate-pinning manifests",
    version,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[clap(subcommand)]
    command: Option<Command>,

    #[clap(flatten)]
    sign: SignArgs,

    /// Configuration file (default: ./pinsign.yml when present)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Override the output directory (certificates, signed manifests)
    #[clap(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Override the data directory (domain lists, cached manifests)
    #[clap(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override the private key directory
    #[clap(long, global = true)]
    cert_dir: Option<PathBuf>,

    /// Set log level
    #[clap(long, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Emit logs as JSON lines
    #[clap(long, global = true)]
    log_json: bool,

    /// Machine-readable output on stdout
    #[clap(long, global = true)]
    json: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Verify a signed manifest against its trust anchor
    Verify(verify_cli::VerifyArgs),

    /// Check a live endpoint against the pins of a verified manifest
    Check(verify_cli::CheckArgs),
}

#[derive(Args, Debug)]
struct SignArgs {
    /// Fetch every certificate again instead of reusing the cached manifest
    #[clap(short = 'f', long, alias = "force_update")]
    force_update: bool,

    /// Customer to sign for (repeatable)
    #[clap(short = 'c', long = "customer", value_name = "CUSTOMER")]
    customers: Vec<String>,

    /// Stamp manifests 20 years in the future (testing relying parties only)
    #[clap(short = 't', long, alias = "test_timestamp")]
    test_timestamp: bool,

    /// Customers to sign for
    #[clap(value_name = "CUSTOMER")]
    positional: Vec<String>,
}

impl SignArgs {
    /// `-c` values then positionals, first occurrence wins
    fn customer_list(&self) -> Vec<String> {
        let mut list: Vec<String> = Vec::new();
        for customer in self.customers.iter().chain(&self.positional) {
            if !list.contains(customer) {
                list.push(customer.clone());
            }
        }
        list
    }

    fn run_options(&self) -> RunOptions {
        RunOptions {
            force_refresh: self.force_update,
            timestamp_mode: if self.test_timestamp {
                TimestampMode::FarFutureTest
            } else {
                TimestampMode::Normal
            },
        }
    }
}

/// Initialize tracing with CLI flags
///
/// Logs always go to stderr; stdout carries reports only.
fn initialize_tracing(log_level: &LogLevel, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_filter_directive()));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Resolve configuration, then apply directory overrides
fn load_config(cli: &Cli) -> Result<SignerConfig> {
    let cwd = std::env::current_dir().context("Failed to determine working directory")?;
    let mut config = SignerConfig::discover(cli.config.as_deref(), &cwd)?;

    if let Some(dir) = &cli.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(dir) = &cli.cert_dir {
        config.cert_dir = dir.clone();
    }

    debug!(?config, "Resolved configuration");
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_tracing(&cli.log_level, cli.log_json);
    let config = load_config(&cli)?;

    match cli.command {
        Some(Command::Verify(args)) => args.execute(&config).await,
        Some(Command::Check(args)) => args.execute(&config, cli.json).await,
        None => sign_command(config, &cli.sign, cli.json).await,
    }
}

async fn sign_command(config: SignerConfig, args: &SignArgs, json: bool) -> Result<()> {
    let customers = args.customer_list();
    if customers.is_empty() {
        eprintln!("No customer given.");
        eprintln!("Usage: pinsign [-f] [-t] -c CUSTOMER [-c CUSTOMER ...]");
        std::process::exit(EXIT_NO_CUSTOMERS);
    }

    let pipeline = Pipeline::with_defaults(config).context("Failed to set up the TLS client")?;

    let shutdown = pipeline.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight work and stopping");
            shutdown.store(true, Ordering::SeqCst);
        }
    });

    let report = pipeline
        .run(&customers, &args.run_options())
        .await
        .map_err(|e| {
            e.log_if_security_critical();
            anyhow::Error::new(e)
        })
        .context("Signing run aborted")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}

#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Customer")]
    customer: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Hosts")]
    hosts: String,
    #[tabled(rename = "Skipped")]
    skipped: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

fn print_report(report: &RunReport) {
    let rows: Vec<OutcomeRow> = report
        .outcomes
        .iter()
        .map(|outcome| match &outcome.status {
            CustomerStatus::Signed {
                artifact,
                hosts,
                skipped_hosts,
                anchor_created,
                ..
            } => OutcomeRow {
                customer: outcome.customer.clone(),
                status: if *anchor_created {
                    "signed (new anchor)".to_string()
                } else {
                    "signed".to_string()
                },
                hosts: hosts.to_string(),
                skipped: skipped_hosts.len().to_string(),
                detail: artifact.display().to_string(),
            },
            CustomerStatus::Skipped { reason } => OutcomeRow {
                customer: outcome.customer.clone(),
                status: "skipped".to_string(),
                hosts: "-".to_string(),
                skipped: "-".to_string(),
                detail: first_line(reason),
            },
            CustomerStatus::Failed { error, .. } => OutcomeRow {
                customer: outcome.customer.clone(),
                status: "FAILED".to_string(),
                hosts: "-".to_string(),
                skipped: "-".to_string(),
                detail: first_line(error),
            },
        })
        .collect();

    if rows.is_empty() {
        println!("No customers processed.");
        return;
    }

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()))
        .to_string();
    println!("{table}");
    println!(
        "{} signed, {} failed, {} total",
        report.signed_count(),
        report.failed_count(),
        report.outcomes.len()
    );
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().to_string()
}
