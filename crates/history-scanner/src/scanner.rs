//! Chunked scanning of one archive.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use henyey_common::Hash256;
use tracing::{info, warn};

use crate::checkpoint::CheckPointGenerator;
use crate::error::ScanError;
use crate::range_scanner::{RangeScan, RangeScanParams};
use crate::scan::{Scan, ScanJob};
use crate::settings::{ScanSettings, ScanSettingsFactory};

/// Turns a [`ScanJob`] into a [`Scan`] by verifying its range one chunk at
/// a time.
#[derive(Clone)]
pub struct Scanner {
    settings_factory: ScanSettingsFactory,
    range_scanner: Arc<dyn RangeScan>,
    generator: CheckPointGenerator,
    range_size: u32,
}

/// Progress carried from one chunk to the next.
struct ChainProgress {
    latest_scanned_ledger: u32,
    latest_scanned_ledger_header_hash: Option<Hash256>,
    scanned_bucket_hashes: HashSet<Hash256>,
}

impl Scanner {
    pub fn new(
        settings_factory: ScanSettingsFactory,
        range_scanner: Arc<dyn RangeScan>,
        generator: CheckPointGenerator,
        range_size: u32,
    ) -> Self {
        Self {
            settings_factory,
            range_scanner,
            generator,
            range_size: range_size.max(1),
        }
    }

    /// Scan the job's archive. Never fails: problems end up in
    /// [`Scan::error`].
    pub async fn perform(&self, time: DateTime<Utc>, job: ScanJob) -> Scan {
        let chain_init_date = job.chain_init_date.unwrap_or(time);
        info!(url = %job.url, new_chain = job.is_new_scan_chain(), "Starting scan");

        let settings = match self.settings_factory.determine(&job).await {
            Ok(settings) => settings,
            Err(error) => {
                warn!(url = %job.url, error = %error, "Cannot determine scan settings");
                return Scan {
                    scan_chain_init_date: chain_init_date,
                    start_date: time,
                    end_date: Utc::now(),
                    base_url: job.url,
                    from_ledger: job.from_ledger.unwrap_or(0),
                    to_ledger: job.to_ledger.unwrap_or(0),
                    latest_scanned_ledger: job.latest_scanned_ledger,
                    latest_scanned_ledger_header_hash: job.latest_scanned_ledger_header_hash,
                    concurrency: job.concurrency.unwrap_or(0),
                    is_slow_archive: false,
                    error: Some(error),
                };
            }
        };

        let (progress, error) = self.scan_in_chunks(&job, &settings).await;
        let scan = Scan {
            scan_chain_init_date: chain_init_date,
            start_date: time,
            end_date: Utc::now(),
            base_url: job.url,
            from_ledger: settings.from_ledger,
            to_ledger: settings.to_ledger,
            latest_scanned_ledger: progress.latest_scanned_ledger,
            latest_scanned_ledger_header_hash: progress.latest_scanned_ledger_header_hash,
            concurrency: settings.concurrency,
            is_slow_archive: settings.is_slow_archive,
            error,
        };
        match &scan.error {
            None => info!(
                url = %scan.base_url,
                latest_scanned_ledger = scan.latest_scanned_ledger,
                buckets = progress.scanned_bucket_hashes.len(),
                "Scan finished"
            ),
            Some(error) => warn!(
                url = %scan.base_url,
                latest_scanned_ledger = scan.latest_scanned_ledger,
                error_type = %error.error_type,
                error = %error,
                "Scan stopped"
            ),
        }
        scan
    }

    /// Verify `[from, to]` chunk by chunk, stopping at the first error.
    ///
    /// Chunks are `[from, from + range_size]` and the next one starts right
    /// after, so a checkpoint on a chunk boundary is scanned exactly once.
    async fn scan_in_chunks(
        &self,
        job: &ScanJob,
        settings: &ScanSettings,
    ) -> (ChainProgress, Option<ScanError>) {
        let mut progress = ChainProgress {
            latest_scanned_ledger: settings.latest_scanned_ledger,
            latest_scanned_ledger_header_hash: settings.latest_scanned_ledger_header_hash,
            scanned_bucket_hashes: HashSet::new(),
        };

        if settings.from_ledger >= settings.to_ledger {
            return (progress, None);
        }
        let mut from_ledger = settings.from_ledger;
        loop {
            let to_ledger = from_ledger
                .saturating_add(self.range_size)
                .min(settings.to_ledger);
            let params = RangeScanParams {
                base_url: job.url.clone(),
                concurrency: settings.concurrency,
                from_ledger,
                to_ledger,
                latest_scanned_ledger: progress.latest_scanned_ledger,
                latest_scanned_ledger_header_hash: progress.latest_scanned_ledger_header_hash,
                already_scanned_bucket_hashes: std::mem::take(&mut progress.scanned_bucket_hashes),
            };

            match self.range_scanner.scan(params).await {
                Ok(result) => {
                    progress.scanned_bucket_hashes = result.scanned_bucket_hashes;
                    match result.latest_ledger_header {
                        Some(header) => {
                            progress.latest_scanned_ledger = header.ledger;
                            progress.latest_scanned_ledger_header_hash = Some(header.hash);
                        }
                        None => {
                            // Existence-only scans know which checkpoints
                            // exist but not their header hashes.
                            if let Some(checkpoint) =
                                self.generator.generate(from_ledger, to_ledger).last()
                            {
                                progress.latest_scanned_ledger = checkpoint;
                                progress.latest_scanned_ledger_header_hash = None;
                            }
                        }
                    }
                }
                Err(error) => return (progress, Some(error)),
            }
            if to_ledger >= settings.to_ledger {
                return (progress, None);
            }
            from_ledger = to_ledger + 1;
        }
    }
}
