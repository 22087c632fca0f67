//! History archive scanning and verification.
//!
//! Stellar validators publish their ledger history to HTTP-accessible
//! "history archives". This crate walks an archive checkpoint by checkpoint
//! and proves that what was published is complete and internally consistent:
//!
//! - every checkpoint has its HAS, ledger, transactions and results files
//! - transaction sets and result sets hash to what the ledger headers claim
//! - ledger headers form an unbroken hash chain
//! - the bucket list hash in each checkpoint header matches its HAS file
//! - every referenced bucket exists and its content hashes to its name
//!
//! # Archive layout
//!
//! ```text
//! .well-known/stellar-history.json             # latest state
//! history/00/00/00/history-0000003f.json       # HAS for checkpoint 63
//! ledger/00/00/00/ledger-0000003f.xdr.gz       # ledger headers 1..=63
//! transactions/00/00/00/transactions-0000003f.xdr.gz
//! results/00/00/00/results-0000003f.xdr.gz
//! bucket/e1/13/f8/bucket-e113f8...fd.xdr.gz     # bucket by content hash
//! ```
//!
//! # Scan lifecycle
//!
//! A [`Scanner`] turns a [`ScanJob`] into a [`Scan`] record. It resolves the
//! ledger range and concurrency ([`ScanSettingsFactory`]), then drives a
//! [`RangeScanner`] over fixed-size ledger chunks. Each chunk goes through
//! three phases:
//!
//! 1. HAS files are fetched to collect bucket hashes and bucket list hashes
//! 2. category files are streamed, decompressed, split into XDR records and
//!    hashed on a [`HasherPool`]; [`CategoryVerificationService`] then checks
//!    every ledger
//! 3. buckets not seen in an earlier chunk are downloaded and hashed
//!
//! The first failure ends the scan; the resulting [`Scan`] carries the
//! classified [`ScanError`] and the last ledger that was fully verified, so
//! the next run of the chain resumes from there.
//!
//! All HTTP traffic goes through [`HttpQueue`], which bounds concurrency,
//! retries transient failures with exponential backoff, and cancels the
//! remaining batch on the first terminal error.

pub mod archive_state;
pub mod bucket_scanner;
pub mod category_scanner;
pub mod checkpoint;
pub mod coordinator;
pub mod error;
pub mod hasher_pool;
pub mod http_queue;
pub mod performance;
pub mod range_scanner;
pub mod repository;
pub mod scan;
pub mod scanner;
pub mod scheduler;
pub mod settings;
pub mod url_builder;
pub mod verification;
pub mod xdr_stream;

pub use archive_state::{HASBucketLevel, HASBucketNext, HistoryArchiveState};
pub use bucket_scanner::{BucketScanState, BucketScanner};
pub use category_scanner::{CategoryScanState, CategoryScanner, HasScanResult};
pub use checkpoint::{CheckPointFrequency, CheckPointGenerator, CheckPointRange};
pub use coordinator::{CoordinatorError, HistoryArchiveService, ScanCoordinator};
pub use error::{
    ErrorCause, QueueError, QueueErrorKind, RepositoryError, ScanError, ScanErrorType,
    VerificationFailure,
};
pub use hasher_pool::{HasherPool, HasherPoolConfig};
pub use http_queue::{
    ConnectionPool, HttpQueue, HttpSettings, QueueOptions, Request, RequestContext, RequestMethod,
};
pub use performance::{ArchivePerformanceTester, PerformanceTestConfig, PerformanceTestResult};
pub use range_scanner::{RangeScan, RangeScanParams, RangeScanResult, RangeScanner};
pub use repository::{InMemoryScanRepository, ScanRepository};
pub use scan::{Scan, ScanJob};
pub use scanner::Scanner;
pub use scheduler::{ContinueAllScans, RestartAtLeastOneScan, ScanScheduler};
pub use settings::{ScanSettings, ScanSettingsConfig, ScanSettingsFactory};
pub use url_builder::{Category, UrlBuilder};
pub use verification::{
    CategoryVerificationData, CategoryVerificationService, ExpectedHashes, LedgerHeaderRef,
};

/// Number of ledgers between checkpoints on every Stellar network.
pub const CHECKPOINT_FREQUENCY: u32 = 64;

/// Default number of ledgers handed to one [`RangeScanner`] invocation.
pub const DEFAULT_RANGE_SIZE: u32 = 1_000_000;
