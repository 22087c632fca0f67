//! Archive benchmarking.
//!
//! Archives differ wildly in how much parallelism they tolerate. Before a
//! scan, [`ArchivePerformanceTester`] times HEAD requests for the files of
//! the most recent checkpoints at a descending list of concurrency levels
//! and keeps the fastest. Every timed pass runs with cache busting so a CDN
//! in front of the archive cannot flatter the numbers.

use std::time::{Duration, Instant};

use henyey_common::Url;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckPointGenerator;
use crate::error::ScanError;
use crate::http_queue::{ConnectionPool, HttpQueue, HttpSettings, Request};
use crate::url_builder::{Category, UrlBuilder};

/// Stop benchmarking after this many consecutive slower candidates.
const MAX_CONSECUTIVE_REGRESSIONS: usize = 2;

/// Files requested per checkpoint: the HAS file plus the three XDR files.
const FILES_PER_CHECKPOINT: usize = 1 + Category::XDR.len();

#[derive(Debug, Clone)]
pub struct PerformanceTestConfig {
    /// Candidate concurrency levels, tried in the given order (highest first).
    pub concurrency_candidates: Vec<usize>,
    /// Number of recent checkpoints whose files are requested per pass.
    pub nr_of_checkpoints: u32,
    /// Mean per-file latency above which an archive counts as slow.
    pub slow_archive_threshold: Duration,
}

impl Default for PerformanceTestConfig {
    fn default() -> Self {
        Self {
            concurrency_candidates: vec![50, 35, 25, 20, 15, 10, 5],
            nr_of_checkpoints: 100,
            slow_archive_threshold: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformanceTestResult {
    pub optimal_concurrency: usize,
    /// Mean duration of one request at the optimal concurrency.
    pub time_per_file: Duration,
    pub is_slow_archive: bool,
}

#[derive(Debug, Clone)]
pub struct ArchivePerformanceTester {
    http_queue: HttpQueue,
    http: HttpSettings,
    generator: CheckPointGenerator,
    config: PerformanceTestConfig,
}

impl ArchivePerformanceTester {
    pub fn new(
        http_queue: HttpQueue,
        http: HttpSettings,
        generator: CheckPointGenerator,
        config: PerformanceTestConfig,
    ) -> Self {
        Self {
            http_queue,
            http,
            generator,
            config,
        }
    }

    pub fn config(&self) -> &PerformanceTestConfig {
        &self.config
    }

    /// Benchmark `base_url` around `latest_ledger`.
    ///
    /// Fails only when every candidate failed; individual failing candidates
    /// count as regressions.
    pub async fn test(
        &self,
        base_url: &Url,
        latest_ledger: u32,
    ) -> Result<PerformanceTestResult, ScanError> {
        let span = self
            .config
            .nr_of_checkpoints
            .saturating_mul(self.generator.frequency().get());
        let checkpoints: Vec<u32> = self
            .generator
            .generate(latest_ledger.saturating_sub(span), latest_ledger)
            .collect();
        let fallback = self.config.concurrency_candidates.last().copied().unwrap_or(1);
        if checkpoints.is_empty() {
            debug!(url = %base_url, latest_ledger, "No checkpoints to benchmark");
            return Ok(PerformanceTestResult {
                optimal_concurrency: fallback,
                time_per_file: Duration::ZERO,
                is_slow_archive: false,
            });
        }
        let files = checkpoints.len() * FILES_PER_CHECKPOINT;
        info!(url = %base_url, checkpoints = checkpoints.len(), "Benchmarking archive");

        let mut measurements = Vec::new();
        let mut previous: Option<Duration> = None;
        let mut regressions = 0;
        let mut last_error = None;
        for &concurrency in &self.config.concurrency_candidates {
            match self.measure(base_url, &checkpoints, concurrency).await {
                Ok(duration) => {
                    debug!(
                        url = %base_url,
                        concurrency,
                        duration_ms = duration.as_millis() as u64,
                        "Benchmark pass finished"
                    );
                    if previous.is_some_and(|p| duration > p) {
                        regressions += 1;
                    } else {
                        regressions = 0;
                    }
                    previous = Some(duration);
                    measurements.push((concurrency, duration));
                }
                Err(error) => {
                    warn!(url = %base_url, concurrency, error = %error, "Benchmark pass failed");
                    regressions += 1;
                    last_error = Some(error);
                }
            }
            if regressions >= MAX_CONSECUTIVE_REGRESSIONS {
                break;
            }
        }

        let Some((optimal_concurrency, duration)) = fastest(&measurements) else {
            return Err(last_error.unwrap_or_else(|| {
                ScanError::connection(base_url.as_str(), "no concurrency candidates configured")
            }));
        };
        let time_per_file = duration / files as u32;
        let result = PerformanceTestResult {
            optimal_concurrency,
            time_per_file,
            is_slow_archive: time_per_file > self.config.slow_archive_threshold,
        };
        info!(
            url = %base_url,
            concurrency = result.optimal_concurrency,
            time_per_file_ms = time_per_file.as_millis() as u64,
            slow = result.is_slow_archive,
            "Benchmark finished"
        );
        Ok(result)
    }

    /// Open `concurrency` connections, then time one cache-busted pass.
    async fn measure(
        &self,
        base_url: &Url,
        checkpoints: &[u32],
        concurrency: usize,
    ) -> Result<Duration, ScanError> {
        let pool = ConnectionPool::new(concurrency)
            .map_err(|e| ScanError::connection(base_url.as_str(), e.to_string()))?;

        let mut warm_up = self.http.small_file_options(pool.clone(), concurrency);
        warm_up.ramp_up_connections = true;
        warm_up.nr_of_retries = 0;
        let warm_up_requests = checkpoints
            .iter()
            .cycle()
            .take(concurrency)
            .map(|&checkpoint| Request::head(UrlBuilder::has_url(base_url, checkpoint), checkpoint));
        self.http_queue
            .check_existence(warm_up_requests, &warm_up)
            .await?;

        let mut timed = self.http.small_file_options(pool.clone(), concurrency);
        timed.ramp_up_connections = false;
        timed.nr_of_retries = 0;
        timed.cache_busting = true;
        let requests = checkpoints.iter().flat_map(move |&checkpoint| {
            std::iter::once(Request::head(UrlBuilder::has_url(base_url, checkpoint), checkpoint))
                .chain(Category::XDR.into_iter().map(move |category| {
                    Request::head(
                        UrlBuilder::checkpoint_url(base_url, category, checkpoint),
                        checkpoint,
                    )
                }))
        });

        let started = Instant::now();
        let result = self.http_queue.check_existence(requests, &timed).await;
        let elapsed = started.elapsed();
        drop(pool);
        result?;
        Ok(elapsed)
    }
}

/// The candidate with the lowest duration; the earlier one wins ties.
fn fastest(measurements: &[(usize, Duration)]) -> Option<(usize, Duration)> {
    measurements
        .iter()
        .copied()
        .reduce(|best, next| if next.1 < best.1 { next } else { best })
}
