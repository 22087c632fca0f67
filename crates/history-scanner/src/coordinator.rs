//! One scheduling round over every known archive.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use henyey_common::Url;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::RepositoryError;
use crate::repository::ScanRepository;
use crate::scan::{Scan, ScanJob};
use crate::scanner::Scanner;
use crate::scheduler::ScanScheduler;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("cannot list history archives: {0}")]
    Archives(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Source of the archive URLs to scan.
#[async_trait]
pub trait HistoryArchiveService: Send + Sync {
    async fn get_history_archive_urls(&self) -> Result<Vec<Url>, CoordinatorError>;
}

pub struct ScanCoordinator {
    scanner: Scanner,
    repository: Arc<dyn ScanRepository>,
    archives: Arc<dyn HistoryArchiveService>,
    scheduler: Box<dyn ScanScheduler>,
    max_concurrent_scans: usize,
}

impl ScanCoordinator {
    pub fn new(
        scanner: Scanner,
        repository: Arc<dyn ScanRepository>,
        archives: Arc<dyn HistoryArchiveService>,
        scheduler: Box<dyn ScanScheduler>,
        max_concurrent_scans: usize,
    ) -> Self {
        Self {
            scanner,
            repository,
            archives,
            scheduler,
            max_concurrent_scans: max_concurrent_scans.max(1),
        }
    }

    /// Schedule, run and persist one scan per archive.
    pub async fn perform_scans(&self) -> Result<Vec<Scan>, CoordinatorError> {
        let archives = self.archives.get_history_archive_urls().await?;
        let previous = self.repository.find_latest().await?;
        let jobs = self.scheduler.schedule(&archives, &previous);
        info!(
            archives = archives.len(),
            jobs = jobs.len(),
            max_concurrent_scans = self.max_concurrent_scans,
            "Starting scan round"
        );

        let scans: Vec<Scan> = stream::iter(jobs)
            .map(|job| self.scanner.perform(Utc::now(), job))
            .buffer_unordered(self.max_concurrent_scans)
            .collect()
            .await;

        let failed = scans.iter().filter(|scan| scan.has_error()).count();
        if failed > 0 {
            warn!(failed, total = scans.len(), "Some scans stopped with errors");
        }
        self.repository.save(&scans).await?;
        info!(scans = scans.len(), "Scan round persisted");
        Ok(scans)
    }

    /// Run and persist a single job.
    pub async fn perform_scan(&self, job: ScanJob) -> Result<Scan, CoordinatorError> {
        let scan = self.scanner.perform(Utc::now(), job).await;
        self.repository.save(std::slice::from_ref(&scan)).await?;
        Ok(scan)
    }

    pub fn repository(&self) -> &Arc<dyn ScanRepository> {
        &self.repository
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category_scanner::CategoryScanner;
    use crate::checkpoint::CheckPointGenerator;
    use crate::hasher_pool::HasherPoolConfig;
    use crate::http_queue::{HttpQueue, HttpSettings};
    use crate::performance::{ArchivePerformanceTester, PerformanceTestConfig};
    use crate::range_scanner::{RangeScan, RangeScanParams, RangeScanResult};
    use crate::repository::InMemoryScanRepository;
    use crate::scheduler::ContinueAllScans;
    use crate::settings::{ScanSettingsConfig, ScanSettingsFactory};
    use crate::ScanError;

    struct Archives(Vec<Url>);

    #[async_trait]
    impl HistoryArchiveService for Archives {
        async fn get_history_archive_urls(&self) -> Result<Vec<Url>, CoordinatorError> {
            Ok(self.0.clone())
        }
    }

    struct NoopRangeScanner;

    #[async_trait]
    impl RangeScan for NoopRangeScanner {
        async fn scan(&self, params: RangeScanParams) -> Result<RangeScanResult, ScanError> {
            Ok(RangeScanResult {
                latest_ledger_header: None,
                scanned_bucket_hashes: params.already_scanned_bucket_hashes,
            })
        }
    }

    fn coordinator(repository: Arc<InMemoryScanRepository>, urls: &[&str]) -> ScanCoordinator {
        let generator = CheckPointGenerator::default();
        // A closed port: any network access fails with a connection error.
        let http = HttpSettings {
            nr_of_retries: 0,
            ..HttpSettings::default()
        };
        let factory = ScanSettingsFactory::new(
            CategoryScanner::new(HttpQueue::new(), http.clone(), HasherPoolConfig::default(), generator),
            ArchivePerformanceTester::new(
                HttpQueue::new(),
                http,
                generator,
                PerformanceTestConfig::default(),
            ),
            ScanSettingsConfig::default(),
        );
        let scanner = Scanner::new(factory, Arc::new(NoopRangeScanner), generator, 1_000);
        let archives = urls.iter().map(|u| Url::new(u).unwrap()).collect();
        ScanCoordinator::new(
            scanner,
            repository,
            Arc::new(Archives(archives)),
            Box::new(ContinueAllScans),
            2,
        )
    }

    #[tokio::test]
    async fn test_perform_scans_persists_one_scan_per_archive() {
        let repository = Arc::new(InMemoryScanRepository::new());
        let coordinator =
            coordinator(repository.clone(), &["http://127.0.0.1:1/a", "http://127.0.0.1:1/b"]);

        let scans = coordinator.perform_scans().await.unwrap();
        assert_eq!(scans.len(), 2);
        assert!(scans.iter().all(|scan| scan.has_error()));
        assert_eq!(repository.all().len(), 2);
    }

    #[tokio::test]
    async fn test_perform_scan_with_explicit_settings() {
        let repository = Arc::new(InMemoryScanRepository::new());
        let coordinator = coordinator(repository.clone(), &[]);
        let job = ScanJob::new_scan_chain(Url::new("http://127.0.0.1:1/a").unwrap())
            .with_from_ledger(Some(0))
            .with_to_ledger(Some(127))
            .with_concurrency(Some(2));

        let scan = coordinator.perform_scan(job).await.unwrap();
        assert!(scan.error.is_none());
        assert_eq!(scan.latest_scanned_ledger, 127);
        let stored = repository.find_latest().await.unwrap();
        assert_eq!(stored, vec![scan]);
    }
}
