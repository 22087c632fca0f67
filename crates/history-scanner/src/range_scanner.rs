//! One bounded pass over a ledger range.
//!
//! ```text
//! Idle -> ScanningHas -> ScanningCategories -> ScanningBuckets -> Done
//!              \________________\___________________\_________-> Gap | Error
//! ```
//!
//! A range either verifies completely or fails as a whole; there is no
//! partial credit for the checkpoints that happened to pass.

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use henyey_common::{Hash256, Url};
use tracing::{debug, info, warn};

use crate::bucket_scanner::{BucketScanState, BucketScanner};
use crate::category_scanner::{CategoryScanState, CategoryScanner};
use crate::checkpoint::CheckPointGenerator;
use crate::error::ScanError;
use crate::http_queue::ConnectionPool;
use crate::verification::LedgerHeaderRef;

/// Phases of a range scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeScanPhase {
    Idle,
    ScanningHas,
    ScanningCategories,
    ScanningBuckets,
    Done,
    Gap,
    Error,
}

impl fmt::Display for RangeScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RangeScanPhase::Idle => "idle",
            RangeScanPhase::ScanningHas => "scanning-has",
            RangeScanPhase::ScanningCategories => "scanning-categories",
            RangeScanPhase::ScanningBuckets => "scanning-buckets",
            RangeScanPhase::Done => "done",
            RangeScanPhase::Gap => "gap",
            RangeScanPhase::Error => "error",
        };
        f.write_str(name)
    }
}

/// Inputs of one range scan.
#[derive(Debug, Clone)]
pub struct RangeScanParams {
    pub base_url: Url,
    pub concurrency: usize,
    pub from_ledger: u32,
    pub to_ledger: u32,
    pub latest_scanned_ledger: u32,
    /// Header hash of `latest_scanned_ledger`, when known.
    pub latest_scanned_ledger_header_hash: Option<Hash256>,
    /// Buckets verified by earlier ranges of the same run.
    pub already_scanned_bucket_hashes: HashSet<Hash256>,
}

impl RangeScanParams {
    fn previous_ledger_header(&self) -> Option<LedgerHeaderRef> {
        self.latest_scanned_ledger_header_hash
            .map(|hash| LedgerHeaderRef {
                ledger: self.latest_scanned_ledger,
                hash,
            })
    }
}

/// Output of a successful range scan.
#[derive(Debug, Clone, Default)]
pub struct RangeScanResult {
    /// Highest header verified in this range; `None` when the range held
    /// no checkpoint.
    pub latest_ledger_header: Option<LedgerHeaderRef>,
    /// `already_scanned_bucket_hashes` plus the buckets of this range.
    pub scanned_bucket_hashes: HashSet<Hash256>,
}

/// Seam between the [`Scanner`](crate::Scanner) loop and range scanning.
#[async_trait]
pub trait RangeScan: Send + Sync {
    async fn scan(&self, params: RangeScanParams) -> Result<RangeScanResult, ScanError>;
}

/// HAS, category and bucket scanning over one range.
#[derive(Debug, Clone)]
pub struct RangeScanner {
    category_scanner: CategoryScanner,
    bucket_scanner: BucketScanner,
    generator: CheckPointGenerator,
    verify: bool,
}

impl RangeScanner {
    pub fn new(
        category_scanner: CategoryScanner,
        bucket_scanner: BucketScanner,
        generator: CheckPointGenerator,
    ) -> Self {
        Self {
            category_scanner,
            bucket_scanner,
            generator,
            verify: true,
        }
    }

    /// Only check that files exist instead of hashing their content.
    pub fn existence_only(mut self) -> Self {
        self.verify = false;
        self
    }

    async fn run(
        &self,
        params: &RangeScanParams,
        pool: &ConnectionPool,
        phase: &mut RangeScanPhase,
    ) -> Result<RangeScanResult, ScanError> {
        let checkpoints = self.generator.range(params.from_ledger, params.to_ledger);

        enter(phase, RangeScanPhase::ScanningHas, &params.base_url);
        let empty = HashMap::new();
        let has_state = CategoryScanState {
            base_url: &params.base_url,
            concurrency: params.concurrency,
            pool: pool.clone(),
            checkpoints,
            bucket_list_hashes: &empty,
            previous_ledger_header: params.previous_ledger_header(),
        };
        let has = self
            .category_scanner
            .scan_has_files_and_return_bucket_hashes(&has_state, self.verify)
            .await?;

        enter(phase, RangeScanPhase::ScanningCategories, &params.base_url);
        let category_state = CategoryScanState {
            bucket_list_hashes: &has.bucket_list_hashes,
            ..has_state
        };
        let latest_ledger_header = self
            .category_scanner
            .scan_other_categories(&category_state, self.verify)
            .await?;

        enter(phase, RangeScanPhase::ScanningBuckets, &params.base_url);
        let mut new_buckets: Vec<Hash256> = has
            .bucket_hashes
            .difference(&params.already_scanned_bucket_hashes)
            .copied()
            .collect();
        new_buckets.sort_unstable();
        debug!(
            url = %params.base_url,
            total = has.bucket_hashes.len(),
            new = new_buckets.len(),
            "Bucket hashes to scan"
        );
        let bucket_state = BucketScanState {
            base_url: &params.base_url,
            concurrency: params.concurrency,
            pool: pool.clone(),
            bucket_hashes: new_buckets,
        };
        self.bucket_scanner.scan(&bucket_state, self.verify).await?;

        let mut scanned_bucket_hashes = params.already_scanned_bucket_hashes.clone();
        scanned_bucket_hashes.extend(bucket_state.bucket_hashes);
        Ok(RangeScanResult {
            latest_ledger_header,
            scanned_bucket_hashes,
        })
    }
}

fn enter(phase: &mut RangeScanPhase, next: RangeScanPhase, url: &Url) {
    debug!(url = %url, from = %phase, to = %next, "Range scan phase");
    *phase = next;
}

#[async_trait]
impl RangeScan for RangeScanner {
    async fn scan(&self, params: RangeScanParams) -> Result<RangeScanResult, ScanError> {
        info!(
            url = %params.base_url,
            from_ledger = params.from_ledger,
            to_ledger = params.to_ledger,
            concurrency = params.concurrency,
            "Scanning range"
        );
        let pool = ConnectionPool::new(params.concurrency)
            .map_err(|e| ScanError::connection(params.base_url.as_str(), e.to_string()))?;

        let mut phase = RangeScanPhase::Idle;
        let result = self.run(&params, &pool, &mut phase).await;
        // Closes the range's idle connections.
        drop(pool);

        match &result {
            Ok(scanned) => {
                let finished = phase;
                enter(&mut phase, RangeScanPhase::Done, &params.base_url);
                info!(
                    url = %params.base_url,
                    after = %finished,
                    latest_ledger = scanned.latest_ledger_header.map(|h| h.ledger),
                    "Range verified"
                );
            }
            Err(error) => {
                let failed_in = phase;
                let terminal = if error.is_gap() {
                    RangeScanPhase::Gap
                } else {
                    RangeScanPhase::Error
                };
                enter(&mut phase, terminal, &params.base_url);
                warn!(
                    url = %error.url,
                    phase = %failed_in,
                    outcome = %terminal,
                    error = %error,
                    "Range scan failed"
                );
            }
        }
        result
    }
}
