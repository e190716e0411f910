//! End-to-end pipeline runs against a mock fetcher

mod common;

use chrono::Utc;
use common::{fixture_der, init_test_logging, read, write_domain_list, FastBackend, MockFetcher};
use pinsign_core::config::SignerConfig;
use pinsign_core::error::{ErrorCategory, SignerError};
use pinsign_core::manifest::{TimestampMode, FAR_FUTURE_OFFSET_SECS};
use pinsign_core::pipeline::{CustomerStatus, ManifestSource, Pipeline, RunOptions};
use pinsign_core::signer::ManifestSigner;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

fn pipeline(config: &SignerConfig, fetcher: Arc<MockFetcher>) -> Pipeline {
    Pipeline::new(config.clone(), fetcher, FastBackend::shared())
}

fn example_fetcher() -> Arc<MockFetcher> {
    Arc::new(MockFetcher::new().with_certificate("www.example.com", 443, fixture_der()))
}

fn customers(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn test_signs_manifest_for_single_host() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let config = SignerConfig::rooted_at(dir.path());
    write_domain_list(&config, "acme", "www.example.com:443\n");

    let report = pipeline(&config, example_fetcher())
        .run(&customers(&["acme"]), &RunOptions::default())
        .await
        .unwrap();

    assert!(!report.has_failures());
    assert_eq!(report.signed_count(), 1);
    let CustomerStatus::Signed {
        hosts,
        anchor_created,
        source,
        ref skipped_hosts,
        ..
    } = report.outcomes[0].status
    else {
        panic!("unexpected outcome: {:?}", report.outcomes[0]);
    };
    assert_eq!(hosts, 1);
    assert!(anchor_created);
    assert_eq!(source, ManifestSource::Fetched);
    assert!(skipped_hosts.is_empty());

    let paths = config.customer_paths("acme").unwrap();
    assert!(paths.manifest_cache.exists());
    assert!(paths.private_key.exists());

    let manifest = ManifestSigner::default()
        .open_file(&paths.signed_manifest, &read(&paths.certificate_pem))
        .unwrap();
    assert_eq!(manifest.customer, "acme");
    let record = manifest.host("www.example.com", 443).unwrap();
    assert_eq!(record.fingerprints, vec![common::FIXTURE_FINGERPRINT.to_string()]);
    assert!(record.public_keys[0].starts_with("MIICIjANBgkqhkiG9w0BAQEFAAOCAg8A"));

    // The signed payload uses the historical wire format
    let payload = ManifestSigner::default()
        .open(&read(&paths.signed_manifest), &read(&paths.certificate_der))
        .unwrap();
    let text = String::from_utf8(payload).unwrap();
    assert!(text.starts_with(r#"{"customer":"acme","hashes":[{"hostname":"www.example.com","port":"443","fp":["#));
}

#[tokio::test]
async fn test_unreachable_host_is_skipped() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let config = SignerConfig::rooted_at(dir.path());
    write_domain_list(
        &config,
        "acme",
        "# production\nunreachable.invalid:443\nwww.example.com:443\n",
    );

    let report = pipeline(&config, example_fetcher())
        .run(&customers(&["acme"]), &RunOptions::default())
        .await
        .unwrap();

    let CustomerStatus::Signed {
        hosts,
        ref skipped_hosts,
        ..
    } = report.outcomes[0].status
    else {
        panic!("unexpected outcome: {:?}", report.outcomes[0]);
    };
    assert_eq!(hosts, 1);
    assert_eq!(skipped_hosts.len(), 1);
    assert_eq!(skipped_hosts[0].hostname, "unreachable.invalid");
}

#[tokio::test]
async fn test_records_follow_domain_list_order() {
    let dir = TempDir::new().unwrap();
    let config = SignerConfig::rooted_at(dir.path());
    let hosts = ["c.example.com", "a.example.com", "b.example.com"];
    let mut fetcher = MockFetcher::new();
    for host in hosts {
        fetcher = fetcher.with_certificate(host, 443, fixture_der());
    }
    write_domain_list(
        &config,
        "acme",
        &hosts.map(|h| format!("{h}:443")).join("\n"),
    );

    let pipeline = pipeline(&config, Arc::new(fetcher));
    pipeline
        .run(&customers(&["acme"]), &RunOptions::default())
        .await
        .unwrap();

    let paths = config.customer_paths("acme").unwrap();
    let manifest = ManifestSigner::default()
        .open_file(&paths.signed_manifest, &read(&paths.certificate_der))
        .unwrap();
    let order: Vec<_> = manifest.hashes.iter().map(|r| r.hostname.as_str()).collect();
    assert_eq!(order, hosts);
}

#[tokio::test]
async fn test_missing_domain_list_skips_customer() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let config = SignerConfig::rooted_at(dir.path());
    write_domain_list(&config, "acme", "www.example.com:443\n");

    let report = pipeline(&config, example_fetcher())
        .run(&customers(&["ghost", "acme"]), &RunOptions::default())
        .await
        .unwrap();

    assert!(!report.has_failures());
    assert!(matches!(
        report.outcomes[0].status,
        CustomerStatus::Skipped { .. }
    ));
    assert!(matches!(
        report.outcomes[1].status,
        CustomerStatus::Signed { .. }
    ));

    let ghost = config.customer_paths("ghost").unwrap();
    assert!(!ghost.private_key.exists());
    assert!(!ghost.signed_manifest.exists());
}

#[tokio::test]
async fn test_rerun_reuses_cache_and_anchor() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let config = SignerConfig::rooted_at(dir.path());
    write_domain_list(&config, "acme", "www.example.com:443\n");
    let fetcher = example_fetcher();
    let pipeline = pipeline(&config, fetcher.clone());
    let paths = config.customer_paths("acme").unwrap();

    pipeline
        .run(&customers(&["acme"]), &RunOptions::default())
        .await
        .unwrap();
    let key = read(&paths.private_key);
    let certificate = read(&paths.certificate_der);
    assert_eq!(fetcher.calls(), 1);

    let report = pipeline
        .run(&customers(&["acme"]), &RunOptions::default())
        .await
        .unwrap();
    let CustomerStatus::Signed {
        anchor_created,
        source,
        ..
    } = report.outcomes[0].status
    else {
        panic!("unexpected outcome: {:?}", report.outcomes[0]);
    };
    assert!(!anchor_created);
    assert_eq!(source, ManifestSource::Cached);
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(read(&paths.private_key), key);
    assert_eq!(read(&paths.certificate_der), certificate);

    let forced = RunOptions {
        force_refresh: true,
        ..RunOptions::default()
    };
    let report = pipeline.run(&customers(&["acme"]), &forced).await.unwrap();
    assert!(matches!(
        report.outcomes[0].status,
        CustomerStatus::Signed {
            source: ManifestSource::Fetched,
            ..
        }
    ));
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(read(&paths.private_key), key);
}

#[tokio::test]
async fn test_far_future_timestamp_mode() {
    let dir = TempDir::new().unwrap();
    let config = SignerConfig::rooted_at(dir.path());
    write_domain_list(&config, "acme", "www.example.com:443\n");

    let before = Utc::now().timestamp();
    let options = RunOptions {
        force_refresh: false,
        timestamp_mode: TimestampMode::FarFutureTest,
    };
    let report = pipeline(&config, example_fetcher())
        .run(&customers(&["acme"]), &options)
        .await
        .unwrap();
    let after = Utc::now().timestamp();

    let CustomerStatus::Signed { timestamp, .. } = report.outcomes[0].status else {
        panic!("unexpected outcome: {:?}", report.outcomes[0]);
    };
    assert!(timestamp >= before + FAR_FUTURE_OFFSET_SECS);
    assert!(timestamp <= after + FAR_FUTURE_OFFSET_SECS);
}

#[tokio::test]
async fn test_normal_timestamp_mode_uses_current_time() {
    let dir = TempDir::new().unwrap();
    let config = SignerConfig::rooted_at(dir.path());
    write_domain_list(&config, "acme", "www.example.com:443\n");

    let before = Utc::now().timestamp();
    let options = RunOptions {
        force_refresh: false,
        timestamp_mode: TimestampMode::Normal,
    };
    let report = pipeline(&config, example_fetcher())
        .run(&customers(&["acme"]), &options)
        .await
        .unwrap();
    let after = Utc::now().timestamp();

    let CustomerStatus::Signed { timestamp, .. } = report.outcomes[0].status else {
        panic!("unexpected outcome: {:?}", report.outcomes[0]);
    };
    assert!(before <= timestamp && timestamp <= after);

    let paths = config.customer_paths("acme").unwrap();
    let manifest = ManifestSigner::default()
        .open_file(&paths.signed_manifest, &read(&paths.certificate_pem))
        .unwrap();
    assert_eq!(manifest.timestamp, timestamp);
}

#[tokio::test]
async fn test_one_failing_customer_does_not_stop_others() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let config = SignerConfig::rooted_at(dir.path());
    write_domain_list(&config, "broken", "tls.example.com:443\n");
    write_domain_list(&config, "acme", "www.example.com:443\n");
    let fetcher = Arc::new(
        MockFetcher::new()
            .with_certificate("www.example.com", 443, fixture_der())
            .with_broken_host("tls.example.com", 443),
    );

    let report = pipeline(&config, fetcher)
        .run(&customers(&["broken", "acme"]), &RunOptions::default())
        .await
        .unwrap();

    assert!(report.has_failures());
    assert!(matches!(
        report.outcomes[0].status,
        CustomerStatus::Failed {
            category: ErrorCategory::Transport,
            ..
        }
    ));
    assert!(matches!(
        report.outcomes[1].status,
        CustomerStatus::Signed { .. }
    ));
    assert!(!config
        .customer_paths("broken")
        .unwrap()
        .signed_manifest
        .exists());
}

#[tokio::test]
async fn test_no_reachable_hosts_fails_without_touching_cache() {
    let dir = TempDir::new().unwrap();
    let config = SignerConfig::rooted_at(dir.path());
    write_domain_list(&config, "acme", "down.example.com:443\n");

    let report = pipeline(&config, example_fetcher())
        .run(&customers(&["acme"]), &RunOptions::default())
        .await
        .unwrap();

    assert!(matches!(
        report.outcomes[0].status,
        CustomerStatus::Failed {
            category: ErrorCategory::Configuration,
            ..
        }
    ));
    let paths = config.customer_paths("acme").unwrap();
    assert!(!paths.manifest_cache.exists());
    assert!(!paths.signed_manifest.exists());
}

#[tokio::test]
async fn test_invalid_customer_fails_only_that_customer() {
    let dir = TempDir::new().unwrap();
    let config = SignerConfig::rooted_at(dir.path());
    write_domain_list(&config, "acme", "www.example.com:443\n");

    let report = pipeline(&config, example_fetcher())
        .run(&customers(&["../etc", "acme"]), &RunOptions::default())
        .await
        .unwrap();

    assert!(matches!(
        report.outcomes[0].status,
        CustomerStatus::Failed { .. }
    ));
    assert_eq!(report.signed_count(), 1);
}

#[tokio::test]
async fn test_unwritable_output_directory_stops_run() {
    let dir = TempDir::new().unwrap();
    let mut config = SignerConfig::rooted_at(dir.path());
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"").unwrap();
    config.output_dir = blocker.join("output");
    write_domain_list(&config, "acme", "www.example.com:443\n");

    let err = pipeline(&config, example_fetcher())
        .run(&customers(&["acme"]), &RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SignerError::Setup { .. }));
}

#[tokio::test]
async fn test_shutdown_stops_before_next_customer() {
    let dir = TempDir::new().unwrap();
    let config = SignerConfig::rooted_at(dir.path());
    write_domain_list(&config, "acme", "www.example.com:443\n");
    let fetcher = example_fetcher();

    let pipeline = pipeline(&config, fetcher.clone());
    pipeline.shutdown_handle().store(true, Ordering::SeqCst);

    let err = pipeline
        .run(&customers(&["acme"]), &RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SignerError::Interrupted { .. }));
    assert_eq!(fetcher.calls(), 0);
}
