//! Bounded-concurrency HTTP request engine.
//!
//! [`HttpQueue::send_requests`] pulls requests lazily from an iterator and
//! keeps at most `concurrency` of them in flight. Every request is fetched,
//! optionally handed to an async handler (which may stream and verify the
//! body), and classified:
//!
//! - success: the handler's value goes to the caller's sink
//! - [`QueueErrorKind::Retryable`]: retried up to `nr_of_retries` times,
//!   waiting `2^attempt * retry_base_delay` in between
//! - anything else, or retries exhausted: the batch is cancelled
//!
//! Cancellation stops new requests from being pulled and makes requests
//! still waiting in ramp-up or backoff skip. The call returns only after
//! every request that was started has finished, so no handler or socket
//! outlives it.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use henyey_common::{Hash256, Url};
use reqwest::{Client, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorCause, QueueError};
use crate::url_builder::Category;

/// Default number of retries for retryable failures.
pub const DEFAULT_RETRIES: u32 = 3;

/// Base of the exponential retry backoff.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Stagger between request starts during connection ramp-up.
pub const RAMP_UP_STEP: Duration = Duration::from_millis(20);

/// Timeout for HAS files and HEAD requests.
pub const SMALL_FILE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for streamed category and bucket files.
pub const LARGE_FILE_TIMEOUT: Duration = Duration::from_secs(180);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("henyey-history-scanner/", env!("CARGO_PKG_VERSION"));

/// HTTP connections shared by every request of one scan range.
///
/// One client serves both plain and TLS archives; its idle pool is sized to
/// the scan's concurrency. Idle connections are closed when the last clone
/// is dropped.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    client: Client,
}

impl ConnectionPool {
    pub fn new(max_connections: usize) -> reqwest::Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(max_connections.max(1))
            .build()?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Head,
}

/// Request metadata that knows which checkpoint it belongs to, so failures
/// can be reported against it.
pub trait RequestContext {
    fn checkpoint(&self) -> Option<u32> {
        None
    }
}

impl RequestContext for u32 {
    fn checkpoint(&self) -> Option<u32> {
        Some(*self)
    }
}

impl RequestContext for (u32, Category) {
    fn checkpoint(&self) -> Option<u32> {
        Some(self.0)
    }
}

impl RequestContext for Hash256 {}

impl RequestContext for () {}

/// One request plus caller metadata.
#[derive(Debug, Clone)]
pub struct Request<M> {
    pub url: Url,
    pub method: RequestMethod,
    pub meta: M,
}

impl<M> Request<M> {
    pub fn get(url: Url, meta: M) -> Self {
        Self {
            url,
            method: RequestMethod::Get,
            meta,
        }
    }

    pub fn head(url: Url, meta: M) -> Self {
        Self {
            url,
            method: RequestMethod::Head,
            meta,
        }
    }
}

/// Per-call settings. Passed by reference into every call so concurrent
/// scans never share mutable toggles.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub concurrency: usize,
    /// Stagger the first `concurrency` requests by [`RAMP_UP_STEP`] each.
    pub ramp_up_connections: bool,
    pub nr_of_retries: u32,
    /// Minimum wall-clock duration of one request including its handler.
    pub stall_time: Duration,
    /// Append a random `bust` query parameter to every request.
    pub cache_busting: bool,
    pub timeout: Duration,
    pub retry_base_delay: Duration,
    pub pool: ConnectionPool,
}

impl QueueOptions {
    pub fn new(pool: ConnectionPool, concurrency: usize) -> Self {
        Self {
            concurrency,
            ramp_up_connections: false,
            nr_of_retries: DEFAULT_RETRIES,
            stall_time: Duration::ZERO,
            cache_busting: false,
            timeout: SMALL_FILE_TIMEOUT,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            pool,
        }
    }
}

/// Request behaviour shared by the scanners, split by payload class.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub nr_of_retries: u32,
    pub retry_base_delay: Duration,
    pub stall_time: Duration,
    pub ramp_up_connections: bool,
    pub small_file_timeout: Duration,
    pub large_file_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            nr_of_retries: DEFAULT_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            stall_time: Duration::ZERO,
            ramp_up_connections: true,
            small_file_timeout: SMALL_FILE_TIMEOUT,
            large_file_timeout: LARGE_FILE_TIMEOUT,
        }
    }
}

impl HttpSettings {
    /// Options for HAS files and existence checks.
    pub fn small_file_options(&self, pool: ConnectionPool, concurrency: usize) -> QueueOptions {
        QueueOptions {
            ramp_up_connections: self.ramp_up_connections,
            nr_of_retries: self.nr_of_retries,
            stall_time: self.stall_time,
            timeout: self.small_file_timeout,
            retry_base_delay: self.retry_base_delay,
            ..QueueOptions::new(pool, concurrency)
        }
    }

    /// Options for streamed category and bucket files.
    pub fn large_file_options(&self, pool: ConnectionPool, concurrency: usize) -> QueueOptions {
        QueueOptions {
            timeout: self.large_file_timeout,
            ..self.small_file_options(pool, concurrency)
        }
    }
}

enum RequestOutcome<T, M> {
    Completed(T, Request<M>),
    Skipped,
    Failed(QueueError),
}

/// Counts a request as active for as long as it lives.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn outgoing_url(url: &Url, cache_busting: bool) -> Result<reqwest::Url, QueueError> {
    let mut parsed = url
        .to_parsed()
        .map_err(|e| QueueError::fatal(ErrorCause::Connection, url.as_str(), e.to_string()))?;
    if cache_busting {
        parsed
            .query_pairs_mut()
            .append_pair("bust", &rand::random::<u64>().to_string());
    }
    Ok(parsed)
}

/// The request engine. Stateless apart from its ramp-up step.
#[derive(Debug, Clone)]
pub struct HttpQueue {
    ramp_up_step: Duration,
}

impl Default for HttpQueue {
    fn default() -> Self {
        Self {
            ramp_up_step: RAMP_UP_STEP,
        }
    }
}

impl HttpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ramp_up_step(ramp_up_step: Duration) -> Self {
        Self { ramp_up_step }
    }

    /// Run every request, feeding successful handler results to `sink`.
    ///
    /// Returns the first terminal error after all started requests have
    /// completed. Results that complete after that error are discarded.
    pub async fn send_requests<M, I, T, H, Fut, S>(
        &self,
        requests: I,
        options: &QueueOptions,
        handler: H,
        mut sink: S,
    ) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = Request<M>>,
        M: RequestContext + Clone,
        H: Fn(Response, Request<M>) -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
        S: FnMut(T, Request<M>),
    {
        let cancel = CancellationToken::new();
        let active = AtomicUsize::new(0);
        let pending = requests
            .into_iter()
            .enumerate()
            .take_while(|_| !cancel.is_cancelled());

        let in_flight = stream::iter(pending)
            .map(|(ordinal, request)| {
                self.run_request(ordinal, request, options, &handler, &cancel, &active)
            })
            .buffer_unordered(options.concurrency.max(1));
        futures::pin_mut!(in_flight);

        let mut first_error: Option<QueueError> = None;
        while let Some(outcome) = in_flight.next().await {
            match outcome {
                RequestOutcome::Completed(value, request) => {
                    if first_error.is_none() {
                        sink(value, request);
                    }
                }
                RequestOutcome::Skipped => {}
                RequestOutcome::Failed(error) => {
                    if first_error.is_none() {
                        debug!(url = %error.url, error = %error, "Cancelling remaining requests");
                        cancel.cancel();
                        first_error = Some(error);
                    }
                }
            }
        }
        debug_assert_eq!(active.load(Ordering::Acquire), 0);

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// HEAD-style check that every request succeeds, ignoring bodies.
    pub async fn check_existence<M, I>(
        &self,
        requests: I,
        options: &QueueOptions,
    ) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = Request<M>>,
        M: RequestContext + Clone,
    {
        self.send_requests(
            requests,
            options,
            |_response, _request| futures::future::ready(Ok::<(), QueueError>(())),
            |(), _request| {},
        )
        .await
    }

    async fn run_request<M, T, H, Fut>(
        &self,
        ordinal: usize,
        request: Request<M>,
        options: &QueueOptions,
        handler: &H,
        cancel: &CancellationToken,
        active: &AtomicUsize,
    ) -> RequestOutcome<T, M>
    where
        M: RequestContext + Clone,
        H: Fn(Response, Request<M>) -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        if options.ramp_up_connections && ordinal > 0 && ordinal < options.concurrency {
            let delay = self.ramp_up_step.saturating_mul(ordinal as u32);
            tokio::select! {
                _ = cancel.cancelled() => return RequestOutcome::Skipped,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return RequestOutcome::Skipped;
        }

        let _active = ActiveGuard::enter(active);
        let mut attempt: u32 = 0;
        loop {
            let started = Instant::now();
            let result = self.attempt(&request, options, handler).await;
            let elapsed = started.elapsed();
            if elapsed < options.stall_time {
                tokio::time::sleep(options.stall_time - elapsed).await;
            }

            match result {
                Ok(value) => return RequestOutcome::Completed(value, request),
                Err(error) if error.is_retryable() && attempt < options.nr_of_retries => {
                    let delay = options
                        .retry_base_delay
                        .saturating_mul(2u32.saturating_pow(attempt));
                    warn!(
                        url = %request.url,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying request"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return RequestOutcome::Skipped,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(error) => {
                    return RequestOutcome::Failed(
                        error.with_checkpoint(request.meta.checkpoint()),
                    )
                }
            }
        }
    }

    async fn attempt<M, T, H, Fut>(
        &self,
        request: &Request<M>,
        options: &QueueOptions,
        handler: &H,
    ) -> Result<T, QueueError>
    where
        M: Clone,
        H: Fn(Response, Request<M>) -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let url = outgoing_url(&request.url, options.cache_busting)?;
        let client = options.pool.client();
        let builder = match request.method {
            RequestMethod::Get => client.get(url),
            RequestMethod::Head => client.head(url),
        };
        let response = builder
            .timeout(options.timeout)
            .send()
            .await
            .map_err(|e| QueueError::from_transport(request.url.as_str(), &e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(QueueError::not_found(request.url.as_str()));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(QueueError::retryable(
                ErrorCause::Connection,
                request.url.as_str(),
                "HTTP status 429",
            ));
        }
        if !status.is_success() {
            return Err(QueueError::fatal(
                ErrorCause::Connection,
                request.url.as_str(),
                format!("HTTP status {}", status.as_u16()),
            ));
        }
        debug!(url = %request.url, status = status.as_u16(), "Request succeeded");

        handler(response, request.clone()).await
    }
}
