//! Scanning of HAS files and checkpoint category files.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use futures::StreamExt;
use henyey_common::{Hash256, Url};
use reqwest::Response;
use tracing::{debug, info, warn};

use crate::archive_state::HistoryArchiveState;
use crate::checkpoint::{CheckPointGenerator, CheckPointRange};
use crate::error::{ErrorCause, QueueError, ScanError};
use crate::hasher_pool::{
    AttemptOutcome, HashFailure, HashOutcome, HashTask, HasherPool, HasherPoolConfig,
};
use crate::http_queue::{ConnectionPool, HttpQueue, HttpSettings, Request};
use crate::url_builder::{Category, UrlBuilder};
use crate::verification::{CategoryVerificationData, CategoryVerificationService, LedgerHeaderRef};
use crate::xdr_stream::{GzipStreamDecoder, RecordFrameSplitter};

/// Inputs of one category scan. Built per call and never mutated.
#[derive(Debug, Clone)]
pub struct CategoryScanState<'a> {
    pub base_url: &'a Url,
    pub concurrency: usize,
    pub pool: ConnectionPool,
    pub checkpoints: CheckPointRange,
    /// Bucket list hash per checkpoint, from the HAS phase.
    pub bucket_list_hashes: &'a HashMap<u32, Hash256>,
    /// Last header verified before this range.
    pub previous_ledger_header: Option<LedgerHeaderRef>,
}

/// What the HAS phase collected.
#[derive(Debug, Default)]
pub struct HasScanResult {
    pub bucket_hashes: HashSet<Hash256>,
    pub bucket_list_hashes: HashMap<u32, Hash256>,
}

/// Fetches and checks the per-checkpoint files of an archive.
#[derive(Debug, Clone)]
pub struct CategoryScanner {
    http_queue: HttpQueue,
    http: HttpSettings,
    hasher: HasherPoolConfig,
    generator: CheckPointGenerator,
}

fn invalid_has(url: &Url, error: impl std::fmt::Display) -> QueueError {
    QueueError::fatal(
        ErrorCause::Verification,
        url.as_str(),
        format!("invalid HAS file: {error}"),
    )
}

impl CategoryScanner {
    pub fn new(
        http_queue: HttpQueue,
        http: HttpSettings,
        hasher: HasherPoolConfig,
        generator: CheckPointGenerator,
    ) -> Self {
        Self {
            http_queue,
            http,
            hasher,
            generator,
        }
    }

    pub fn generator(&self) -> CheckPointGenerator {
        self.generator
    }

    /// `currentLedger` of the archive's root HAS file.
    pub async fn find_latest_ledger(&self, base_url: &Url) -> Result<u32, ScanError> {
        let pool = ConnectionPool::new(1)
            .map_err(|e| ScanError::connection(base_url.as_str(), e.to_string()))?;
        let options = self.http.small_file_options(pool, 1);
        let request = Request::get(UrlBuilder::root_has_url(base_url), ());

        let mut latest = None;
        self.http_queue
            .send_requests(
                std::iter::once(request),
                &options,
                |response: Response, request: Request<()>| async move {
                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| QueueError::from_transport(request.url.as_str(), &e))?;
                    let has = HistoryArchiveState::from_slice(&body)
                        .map_err(|e| invalid_has(&request.url, e))?;
                    has.validate().map_err(|e| invalid_has(&request.url, e))?;
                    Ok(has.current_ledger)
                },
                |ledger, _request| latest = Some(ledger),
            )
            .await?;

        let latest = latest.ok_or_else(|| {
            ScanError::connection(base_url.as_str(), "root HAS file returned no ledger")
        })?;
        debug!(url = %base_url, latest_ledger = latest, "Found latest ledger");
        Ok(latest)
    }

    /// Fetch and validate the HAS file of every checkpoint in range.
    ///
    /// Returns the union of their non-zero bucket hashes and, when `verify`
    /// is set, each checkpoint's bucket list hash.
    pub async fn scan_has_files_and_return_bucket_hashes(
        &self,
        state: &CategoryScanState<'_>,
        verify: bool,
    ) -> Result<HasScanResult, ScanError> {
        info!(
            url = %state.base_url,
            checkpoints = state.checkpoints.len(),
            "Scanning HAS files"
        );
        let options = self.http.small_file_options(state.pool.clone(), state.concurrency);
        let base_url = state.base_url.clone();
        let requests = state
            .checkpoints
            .iter()
            .map(move |checkpoint| Request::get(UrlBuilder::has_url(&base_url, checkpoint), checkpoint));

        let mut result = HasScanResult::default();
        self.http_queue
            .send_requests(
                requests,
                &options,
                move |response: Response, request: Request<u32>| async move {
                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| QueueError::from_transport(request.url.as_str(), &e))?;
                    let has = HistoryArchiveState::from_slice(&body)
                        .map_err(|e| invalid_has(&request.url, e))?;
                    has.validate_for_checkpoint(request.meta)
                        .map_err(|e| invalid_has(&request.url, e))?;
                    let bucket_list_hash = if verify {
                        Some(
                            has.bucket_list_hash()
                                .map_err(|e| invalid_has(&request.url, e))?,
                        )
                    } else {
                        None
                    };
                    Ok((has.non_zero_bucket_hashes(), bucket_list_hash))
                },
                |(hashes, bucket_list_hash), request| {
                    result.bucket_hashes.extend(hashes);
                    if let Some(hash) = bucket_list_hash {
                        result.bucket_list_hashes.insert(request.meta, hash);
                    }
                },
            )
            .await?;

        debug!(
            url = %state.base_url,
            buckets = result.bucket_hashes.len(),
            "HAS files scanned"
        );
        Ok(result)
    }

    /// Check the ledger, transactions and results files of every checkpoint.
    ///
    /// Without `verify` this only confirms the files exist. With it, every
    /// file is streamed through the hasher pool and the range is verified
    /// ledger by ledger; the highest verified header is returned.
    pub async fn scan_other_categories(
        &self,
        state: &CategoryScanState<'_>,
        verify: bool,
    ) -> Result<Option<LedgerHeaderRef>, ScanError> {
        let base_url = state.base_url;
        if !verify {
            info!(url = %base_url, "Checking category files exist");
            let options = self.http.small_file_options(state.pool.clone(), state.concurrency);
            let requests = category_requests(base_url, state.checkpoints, Request::head);
            self.http_queue.check_existence(requests, &options).await?;
            return Ok(None);
        }

        info!(url = %base_url, checkpoints = state.checkpoints.len(), "Verifying category files");
        let options = self.http.large_file_options(state.pool.clone(), state.concurrency);
        let requests = category_requests(base_url, state.checkpoints, Request::get);

        let pool = HasherPool::spawn(self.hasher).map_err(|e| {
            ScanError::connection(base_url.as_str(), format!("cannot start hasher pool: {e}"))
        })?;
        let mut outcomes = AttemptOutcomes::default();

        let hasher = &pool;
        let sent = self
            .http_queue
            .send_requests(
                requests,
                &options,
                move |response: Response, request: Request<(u32, Category)>| {
                    stream_category_file(response, request, hasher)
                },
                |attempt, _request| {
                    outcomes.commit(attempt);
                    outcomes.collect(hasher.take_outcomes());
                },
            )
            .await;
        if let Err(error) = sent {
            pool.cancel();
            pool.shutdown().await;
            return Err(error.into());
        }

        pool.drain().await;
        outcomes.collect(pool.take_outcomes());
        pool.shutdown().await;

        let (data, decode_failure) = outcomes.finish();
        if let Some(failure) = decode_failure {
            let url = UrlBuilder::checkpoint_url(base_url, failure.category, failure.checkpoint);
            warn!(url = %url, error = %failure, "Undecodable record");
            return Err(ScanError::verification(url.as_str(), failure.to_string())
                .with_checkpoint(failure.checkpoint));
        }

        CategoryVerificationService::verify(
            &data,
            state.bucket_list_hashes,
            state.checkpoints.iter(),
            self.generator.frequency(),
            state.previous_ledger_header.as_ref(),
        )
        .map_err(|failure| {
            let checkpoint = self.generator.closest_higher_checkpoint(failure.ledger);
            let url = UrlBuilder::checkpoint_url(base_url, failure.category, checkpoint);
            warn!(url = %url, ledger = failure.ledger, error = %failure, "Verification failed");
            ScanError::verification(url.as_str(), failure.to_string()).with_checkpoint(checkpoint)
        })?;

        let highest = data.highest_ledger_header();
        info!(
            url = %base_url,
            ledgers = data.expected_hashes.len(),
            highest_ledger = highest.map(|h| h.ledger),
            "Category files verified"
        );
        Ok(highest)
    }
}

/// Lazily list every XDR category file of `checkpoints`.
fn category_requests(
    base_url: &Url,
    checkpoints: CheckPointRange,
    request: fn(Url, (u32, Category)) -> Request<(u32, Category)>,
) -> impl Iterator<Item = Request<(u32, Category)>> {
    let base_url = base_url.clone();
    checkpoints.iter().flat_map(move |checkpoint| {
        let base_url = base_url.clone();
        Category::XDR.into_iter().map(move |category| {
            request(
                UrlBuilder::checkpoint_url(&base_url, category, checkpoint),
                (checkpoint, category),
            )
        })
    })
}

/// Hash outcomes grouped by download attempt.
///
/// Only attempts whose file streamed to the end are committed; outcomes of
/// any other attempt stay staged and are dropped with it.
#[derive(Default)]
struct AttemptOutcomes {
    committed: HashSet<u64>,
    staged: HashMap<u64, Vec<HashOutcome>>,
    data: CategoryVerificationData,
    failure: Option<HashFailure>,
}

impl AttemptOutcomes {
    fn commit(&mut self, attempt: u64) {
        self.committed.insert(attempt);
        for outcome in self.staged.remove(&attempt).unwrap_or_default() {
            self.merge(outcome);
        }
    }

    fn collect(&mut self, outcomes: Vec<AttemptOutcome>) {
        for AttemptOutcome { attempt, outcome } in outcomes {
            if self.committed.contains(&attempt) {
                self.merge(outcome);
            } else {
                self.staged.entry(attempt).or_default().push(outcome);
            }
        }
    }

    fn merge(&mut self, outcome: HashOutcome) {
        match outcome {
            Ok(record) => record.record_into(&mut self.data),
            Err(error) => {
                if self.failure.is_none() {
                    self.failure = Some(error);
                }
            }
        }
    }

    fn finish(self) -> (CategoryVerificationData, Option<HashFailure>) {
        if !self.staged.is_empty() {
            debug!(attempts = self.staged.len(), "Dropped outcomes of failed downloads");
        }
        (self.data, self.failure)
    }
}

fn corrupt_stream(url: &str, error: impl std::fmt::Display) -> QueueError {
    QueueError::retryable(
        ErrorCause::Verification,
        url,
        format!("corrupt gzip stream: {error}"),
    )
}

/// gunzip the body, split it into records and queue each on the pool.
///
/// Returns the attempt id the records were queued under. A failed attempt
/// is discarded so its queued records are skipped.
async fn stream_category_file(
    response: Response,
    request: Request<(u32, Category)>,
    pool: &HasherPool,
) -> Result<u64, QueueError> {
    let attempt = pool.next_attempt();
    match stream_attempt(response, &request, pool, attempt).await {
        Ok(records) => {
            debug!(url = %request.url, records, attempt, "Category file streamed");
            Ok(attempt)
        }
        Err(error) => {
            pool.discard_attempt(attempt);
            Err(error)
        }
    }
}

async fn stream_attempt(
    response: Response,
    request: &Request<(u32, Category)>,
    pool: &HasherPool,
    attempt: u64,
) -> Result<usize, QueueError> {
    let (checkpoint, category) = request.meta;
    let url = request.url.as_str();
    let body = response.bytes_stream();
    futures::pin_mut!(body);

    let mut decoder = GzipStreamDecoder::new(Vec::new());
    let mut splitter = RecordFrameSplitter::new();
    let task = |frame: Bytes| HashTask {
        attempt,
        category,
        checkpoint,
        frame,
    };
    let mut records = 0usize;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| QueueError::from_transport(url, &e))?;
        decoder.feed(&chunk).map_err(|e| corrupt_stream(url, e))?;
        let inflated = decoder.take_output();
        records += submit_records(pool, &mut splitter, &inflated, task, url).await?;
    }
    let rest = decoder.finish().map_err(|e| corrupt_stream(url, e))?;
    records += submit_records(pool, &mut splitter, &rest, task, url).await?;
    splitter.finish().map_err(|e| corrupt_stream(url, e))?;
    Ok(records)
}

async fn submit_records(
    pool: &HasherPool,
    splitter: &mut RecordFrameSplitter,
    data: &[u8],
    task: impl Fn(Bytes) -> HashTask,
    url: &str,
) -> Result<usize, QueueError> {
    let frames = splitter
        .push(data)
        .map_err(|e| QueueError::fatal(ErrorCause::Verification, url, e.to_string()))?;
    let count = frames.len();
    for frame in frames {
        pool.wait_for_capacity().await;
        pool.submit(task(frame))
            .map_err(|e| QueueError::fatal(ErrorCause::Connection, url, e.to_string()))?;
    }
    Ok(count)
}
