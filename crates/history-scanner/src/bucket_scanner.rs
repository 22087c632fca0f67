//! Bucket existence and content verification.
//!
//! Buckets are content-addressed: `bucket-<hash>.xdr.gz` must gunzip to
//! bytes whose SHA-256 is `<hash>`. Verification streams each file through
//! a gzip decoder straight into a hasher, so no bucket is ever held in
//! memory.

use futures::StreamExt;
use henyey_common::{Hash256, Sha256Hasher, Url};
use reqwest::Response;
use tracing::{debug, info};

use crate::error::{ErrorCause, QueueError, ScanError};
use crate::http_queue::{ConnectionPool, HttpQueue, HttpSettings, Request};
use crate::url_builder::UrlBuilder;
use crate::xdr_stream::GzipStreamDecoder;

/// Inputs of one bucket scan.
#[derive(Debug, Clone)]
pub struct BucketScanState<'a> {
    pub base_url: &'a Url,
    pub concurrency: usize,
    pub pool: ConnectionPool,
    pub bucket_hashes: Vec<Hash256>,
}

#[derive(Debug, Clone, Default)]
pub struct BucketScanner {
    http_queue: HttpQueue,
    http: HttpSettings,
}

impl BucketScanner {
    pub fn new(http_queue: HttpQueue, http: HttpSettings) -> Self {
        Self { http_queue, http }
    }

    /// Check every bucket in `state`: existence only, or full content hash
    /// when `verify` is set.
    pub async fn scan(&self, state: &BucketScanState<'_>, verify: bool) -> Result<(), ScanError> {
        if state.bucket_hashes.is_empty() {
            return Ok(());
        }
        info!(
            url = %state.base_url,
            buckets = state.bucket_hashes.len(),
            verify,
            "Scanning buckets"
        );
        let base_url = state.base_url;

        if !verify {
            let options = self.http.small_file_options(state.pool.clone(), state.concurrency);
            let requests = bucket_requests(state, Request::head);
            self.http_queue.check_existence(requests, &options).await?;
            return Ok(());
        }

        let options = self.http.large_file_options(state.pool.clone(), state.concurrency);
        let requests = bucket_requests(state, Request::get);
        let mut verified = 0usize;
        self.http_queue
            .send_requests(
                requests,
                &options,
                |response: Response, request: Request<Hash256>| verify_bucket(response, request),
                |(), _request| verified += 1,
            )
            .await?;

        debug!(url = %base_url, verified, "Buckets verified");
        Ok(())
    }
}

fn bucket_requests(
    state: &BucketScanState<'_>,
    request: fn(Url, Hash256) -> Request<Hash256>,
) -> impl Iterator<Item = Request<Hash256>> {
    let base_url = state.base_url.clone();
    state
        .bucket_hashes
        .clone()
        .into_iter()
        .map(move |hash| request(UrlBuilder::bucket_url(&base_url, &hash), hash))
}

async fn verify_bucket(response: Response, request: Request<Hash256>) -> Result<(), QueueError> {
    let url = request.url.as_str();
    let body = response.bytes_stream();
    futures::pin_mut!(body);

    // Inflate failures may be transport damage, so they are retried.
    let corrupt = |e: std::io::Error| {
        QueueError::retryable(
            ErrorCause::Verification,
            url,
            format!("cannot decompress bucket: {e}"),
        )
    };

    let mut decoder = GzipStreamDecoder::new(Sha256Hasher::new());
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| QueueError::from_transport(url, &e))?;
        decoder.feed(&chunk).map_err(corrupt)?;
    }
    let hasher = decoder.finish().map_err(corrupt)?;
    let bytes = hasher.bytes_hashed();
    let actual = hasher.finalize();

    if actual != request.meta {
        return Err(QueueError::fatal(
            ErrorCause::Verification,
            url,
            format!("bucket content hashes to {actual}, expected {}", request.meta),
        ));
    }
    debug!(url, bytes, "Bucket hash verified");
    Ok(())
}
