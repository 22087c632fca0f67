//! Resolution of the ledger range and concurrency of a scan.
//!
//! Explicit values on the [`ScanJob`] always win. Whatever is missing is
//! filled in from the archive itself: the target ledger from its root HAS
//! file, the concurrency from a benchmark. An archive found to be slow is
//! only scanned over its most recent ledgers when starting a new chain.

use henyey_common::Hash256;
use tracing::{debug, info};

use crate::category_scanner::CategoryScanner;
use crate::error::ScanError;
use crate::performance::ArchivePerformanceTester;
use crate::scan::ScanJob;

/// Roughly one week of ledgers at five seconds per ledger.
pub const DEFAULT_SLOW_ARCHIVE_MAX_LEDGERS: u32 = 120_960;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettingsConfig {
    /// Ledgers scanned from the tip when a new chain hits a slow archive.
    pub slow_archive_max_ledgers: u32,
}

impl Default for ScanSettingsConfig {
    fn default() -> Self {
        Self {
            slow_archive_max_ledgers: DEFAULT_SLOW_ARCHIVE_MAX_LEDGERS,
        }
    }
}

/// Fully resolved parameters of one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSettings {
    pub from_ledger: u32,
    pub to_ledger: u32,
    pub concurrency: usize,
    pub is_slow_archive: bool,
    pub latest_scanned_ledger: u32,
    pub latest_scanned_ledger_header_hash: Option<Hash256>,
}

#[derive(Debug, Clone)]
pub struct ScanSettingsFactory {
    category_scanner: CategoryScanner,
    performance_tester: ArchivePerformanceTester,
    config: ScanSettingsConfig,
}

impl ScanSettingsFactory {
    pub fn new(
        category_scanner: CategoryScanner,
        performance_tester: ArchivePerformanceTester,
        config: ScanSettingsConfig,
    ) -> Self {
        Self {
            category_scanner,
            performance_tester,
            config,
        }
    }

    pub async fn determine(&self, job: &ScanJob) -> Result<ScanSettings, ScanError> {
        let to_ledger = match job.to_ledger {
            Some(to_ledger) => to_ledger,
            None => self.category_scanner.find_latest_ledger(&job.url).await?,
        };

        let (concurrency, is_slow_archive) = match job.concurrency {
            Some(concurrency) => (concurrency, false),
            None => {
                let result = self.performance_tester.test(&job.url, to_ledger).await?;
                (result.optimal_concurrency, result.is_slow_archive)
            }
        };

        let from_ledger = resolve_from_ledger(job, to_ledger, is_slow_archive, &self.config);
        let settings = if job.is_new_scan_chain() {
            ScanSettings {
                from_ledger,
                to_ledger,
                concurrency,
                is_slow_archive,
                latest_scanned_ledger: from_ledger.saturating_sub(1),
                latest_scanned_ledger_header_hash: None,
            }
        } else {
            ScanSettings {
                from_ledger,
                to_ledger,
                concurrency,
                is_slow_archive,
                latest_scanned_ledger: job.latest_scanned_ledger,
                latest_scanned_ledger_header_hash: job.latest_scanned_ledger_header_hash,
            }
        };

        if is_slow_archive {
            debug!(url = %job.url, from_ledger, "Slow archive");
        }
        info!(
            url = %job.url,
            from_ledger = settings.from_ledger,
            to_ledger = settings.to_ledger,
            concurrency = settings.concurrency,
            "Scan settings resolved"
        );
        Ok(settings)
    }
}

fn resolve_from_ledger(
    job: &ScanJob,
    to_ledger: u32,
    is_slow_archive: bool,
    config: &ScanSettingsConfig,
) -> u32 {
    match job.from_ledger {
        Some(from_ledger) => from_ledger,
        None if is_slow_archive => to_ledger.saturating_sub(config.slow_archive_max_ledgers),
        None => 0,
    }
}
