//! Application shell of the henyey history archive scanner.
//!
//! Everything needed to run the scanner as a service lives here:
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`logging`]: tracing subscriber setup
//! - [`repository`]: a [`ScanRepository`](henyey_history_scanner::ScanRepository)
//!   persisted as a JSON file
//! - [`archives`]: the configured archive list
//!
//! [`build_coordinator`] wires these into a ready-to-run
//! [`ScanCoordinator`].

pub mod archives;
pub mod config;
pub mod logging;
pub mod repository;

use std::sync::Arc;

use henyey_history_scanner::{
    ArchivePerformanceTester, BucketScanner, CategoryScanner, HttpQueue, RangeScanner,
    ScanCoordinator, ScanSettingsFactory, Scanner,
};

pub use archives::ConfiguredArchives;
pub use config::ScannerConfig;
pub use logging::{LogConfig, LogFormat};
pub use repository::JsonFileScanRepository;

/// Build the scanner and coordinator described by `config`.
pub async fn build_coordinator(config: &ScannerConfig) -> anyhow::Result<ScanCoordinator> {
    let generator = config.generator()?;
    let http = config.http_settings();
    let http_queue = HttpQueue::new();

    let category_scanner = CategoryScanner::new(
        http_queue.clone(),
        http.clone(),
        config.hasher_pool_config(),
        generator,
    );
    let bucket_scanner = BucketScanner::new(http_queue.clone(), http.clone());
    let mut range_scanner =
        RangeScanner::new(category_scanner.clone(), bucket_scanner, generator);
    if config.scanner.existence_only {
        range_scanner = range_scanner.existence_only();
    }

    let performance_tester = ArchivePerformanceTester::new(
        http_queue,
        http,
        generator,
        config.performance_test_config(),
    );
    let settings_factory = ScanSettingsFactory::new(
        category_scanner,
        performance_tester,
        config.scan_settings_config(),
    );
    let scanner = Scanner::new(
        settings_factory,
        Arc::new(range_scanner),
        generator,
        config.scanner.range_size,
    );

    let repository = JsonFileScanRepository::open(&config.storage.path).await?;
    let archives = ConfiguredArchives::new(config.archive_urls()?);

    Ok(ScanCoordinator::new(
        scanner,
        Arc::new(repository),
        Arc::new(archives),
        config.scheduler(),
        config.scanner.max_concurrent_scans,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use henyey_common::Url;
    use henyey_history_scanner::{ScanErrorType, ScanJob, ScanRepository};

    #[tokio::test]
    async fn test_built_coordinator_persists_to_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ScannerConfig::default();
        config.storage.path = dir.path().join("scans.json");
        config.http.retries = 0;

        let coordinator = build_coordinator(&config).await.unwrap();
        // Nothing listens on port 1.
        let job = ScanJob::new_scan_chain(Url::new("http://127.0.0.1:1/archive").unwrap())
            .with_from_ledger(Some(0))
            .with_to_ledger(Some(127))
            .with_concurrency(Some(2));
        let scan = coordinator.perform_scan(job).await.unwrap();

        let error = scan.error.clone().expect("closed port should fail");
        assert_eq!(error.error_type, ScanErrorType::Connection);
        assert_eq!(scan.latest_scanned_ledger, 0);

        let reopened = JsonFileScanRepository::open(&config.storage.path).await.unwrap();
        assert_eq!(reopened.find_latest().await.unwrap(), vec![scan]);
    }

    #[tokio::test]
    async fn test_scan_round_without_archives_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ScannerConfig::default();
        config.storage.path = dir.path().join("scans.json");

        let coordinator = build_coordinator(&config).await.unwrap();
        assert!(coordinator.perform_scans().await.is_err());
    }
}
