//! Worker threads for decoding and hashing XDR records.
//!
//! Decoding a ledger header or a transaction set and hashing it is CPU work
//! that would stall the I/O loop if done inline. A [`HasherPool`] owns a
//! fixed set of OS threads fed through a task channel; each task is one
//! record (category + raw bytes) and each result is a small
//! [`HashedRecord`]. The pool keeps a pending-task gauge so producers can
//! apply backpressure before buffering more records.
//!
//! Every task is tagged with the download attempt that produced it. When an
//! attempt fails, [`discard_attempt`](HasherPool::discard_attempt) makes the
//! workers drop its remaining tasks, and callers ignore outcomes of attempts
//! that never completed.
//!
//! The pool's lifecycle is explicit: [`spawn`](HasherPool::spawn),
//! [`drain`](HasherPool::drain) until nothing is pending, then
//! [`shutdown`](HasherPool::shutdown) to join the workers. On an error path,
//! [`cancel`](HasherPool::cancel) first so queued tasks are skipped.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel as channel;
use henyey_common::{Hash256, Sha256Hasher};
use parking_lot::Mutex;
use stellar_xdr::curr::{
    LedgerHeaderHistoryEntry, Limits, ReadXdr, TransactionHistoryEntry,
    TransactionHistoryEntryExt, TransactionHistoryResultEntry, WriteXdr,
};
use tracing::{debug, warn};

use crate::url_builder::Category;
use crate::verification::{CategoryVerificationData, ExpectedHashes};

/// Share of `max_pending` above which producers must wait.
const SATURATION_PERCENT: usize = 80;
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct HasherPoolConfig {
    pub workers: usize,
    /// Pending-task ceiling used for backpressure.
    pub max_pending: usize,
}

impl Default for HasherPoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_pending: 10_000,
        }
    }
}

/// One record to decode and hash.
#[derive(Debug, Clone)]
pub struct HashTask {
    /// Download attempt the record was read in.
    pub attempt: u64,
    pub category: Category,
    pub checkpoint: u32,
    pub frame: Bytes,
}

/// What a record contributed to verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashedRecord {
    TransactionSet {
        ledger: u32,
        hash: Hash256,
    },
    TransactionResults {
        ledger: u32,
        hash: Hash256,
    },
    LedgerHeader {
        ledger: u32,
        hash: Hash256,
        protocol_version: u32,
        expected: ExpectedHashes,
    },
}

impl HashedRecord {
    /// Merge into the range's accumulation maps.
    pub fn record_into(self, data: &mut CategoryVerificationData) {
        match self {
            HashedRecord::TransactionSet { ledger, hash } => {
                data.calculated_tx_set_hashes.insert(ledger, hash);
            }
            HashedRecord::TransactionResults { ledger, hash } => {
                data.calculated_tx_result_hashes.insert(ledger, hash);
            }
            HashedRecord::LedgerHeader {
                ledger,
                hash,
                protocol_version,
                expected,
            } => {
                data.calculated_ledger_header_hashes.insert(ledger, hash);
                data.protocol_versions.insert(ledger, protocol_version);
                data.expected_hashes.insert(ledger, expected);
            }
        }
    }
}

/// A record that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot decode {category} record of checkpoint {checkpoint}: {message}")]
pub struct HashFailure {
    pub category: Category,
    pub checkpoint: u32,
    pub message: String,
}

pub type HashOutcome = Result<HashedRecord, HashFailure>;

/// A [`HashOutcome`] and the attempt whose record produced it.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub attempt: u64,
    pub outcome: HashOutcome,
}

/// The pool stopped accepting tasks.
#[derive(Debug, thiserror::Error)]
#[error("hasher pool is shut down")]
pub struct PoolClosed;

/// Decode one category record and hash it.
pub fn hash_record(category: Category, frame: &[u8]) -> Result<HashedRecord, stellar_xdr::curr::Error> {
    match category {
        Category::Transactions => {
            let entry = TransactionHistoryEntry::from_xdr(frame, Limits::none())?;
            let hash = match &entry.ext {
                TransactionHistoryEntryExt::V0 => {
                    let mut hasher = Sha256Hasher::new();
                    hasher.update(&entry.tx_set.previous_ledger_hash.0);
                    for tx in entry.tx_set.txs.iter() {
                        hasher.update(&tx.to_xdr(Limits::none())?);
                    }
                    hasher.finalize()
                }
                TransactionHistoryEntryExt::V1(set) => Hash256::hash_xdr(set)?,
            };
            Ok(HashedRecord::TransactionSet {
                ledger: entry.ledger_seq,
                hash,
            })
        }
        Category::Results => {
            let entry = TransactionHistoryResultEntry::from_xdr(frame, Limits::none())?;
            Ok(HashedRecord::TransactionResults {
                ledger: entry.ledger_seq,
                hash: Hash256::hash_xdr(&entry.tx_result_set)?,
            })
        }
        Category::Ledger => {
            let entry = LedgerHeaderHistoryEntry::from_xdr(frame, Limits::none())?;
            let header = &entry.header;
            Ok(HashedRecord::LedgerHeader {
                ledger: header.ledger_seq,
                hash: Hash256::hash_xdr(header)?,
                protocol_version: header.ledger_version,
                expected: ExpectedHashes {
                    tx_set_hash: (&header.scp_value.tx_set_hash).into(),
                    tx_set_result_hash: (&header.tx_set_result_hash).into(),
                    previous_ledger_header_hash: (&header.previous_ledger_hash).into(),
                    bucket_list_hash: (&header.bucket_list_hash).into(),
                },
            })
        }
        Category::History => Err(stellar_xdr::curr::Error::Invalid),
    }
}

/// State shared between the pool handle and its workers.
#[derive(Default)]
struct Shared {
    pending: AtomicUsize,
    cancelled: AtomicBool,
    discarded: Mutex<HashSet<u64>>,
}

impl Shared {
    fn skips(&self, task: &HashTask) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.discarded.lock().contains(&task.attempt)
    }
}

/// Fixed-size pool of hashing threads.
pub struct HasherPool {
    tasks: Option<channel::Sender<HashTask>>,
    outcomes: channel::Receiver<AttemptOutcome>,
    shared: Arc<Shared>,
    next_attempt: AtomicU64,
    workers: Vec<JoinHandle<()>>,
    config: HasherPoolConfig,
}

impl HasherPool {
    /// Start `config.workers` threads (at least one).
    pub fn spawn(config: HasherPoolConfig) -> io::Result<Self> {
        let (task_tx, task_rx) = channel::unbounded::<HashTask>();
        let (outcome_tx, outcome_rx) = channel::unbounded::<AttemptOutcome>();
        let shared = Arc::new(Shared::default());

        let mut workers = Vec::with_capacity(config.workers.max(1));
        for index in 0..config.workers.max(1) {
            let tasks = task_rx.clone();
            let outcomes = outcome_tx.clone();
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("hasher-{index}"))
                .spawn(move || {
                    for task in tasks.iter() {
                        if !shared.skips(&task) {
                            let outcome =
                                hash_record(task.category, &task.frame).map_err(|e| HashFailure {
                                    category: task.category,
                                    checkpoint: task.checkpoint,
                                    message: e.to_string(),
                                });
                            // The receiver only disappears with the pool itself.
                            let _ = outcomes.send(AttemptOutcome {
                                attempt: task.attempt,
                                outcome,
                            });
                        }
                        shared.pending.fetch_sub(1, Ordering::AcqRel);
                    }
                })?;
            workers.push(handle);
        }
        debug!(workers = workers.len(), max_pending = config.max_pending, "Hasher pool started");

        Ok(Self {
            tasks: Some(task_tx),
            outcomes: outcome_rx,
            shared,
            next_attempt: AtomicU64::new(0),
            workers,
            config,
        })
    }

    pub fn submit(&self, task: HashTask) -> Result<(), PoolClosed> {
        let sender = self.tasks.as_ref().ok_or(PoolClosed)?;
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if sender.send(task).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(PoolClosed);
        }
        Ok(())
    }

    /// A fresh id for one download attempt.
    pub fn next_attempt(&self) -> u64 {
        self.next_attempt.fetch_add(1, Ordering::Relaxed)
    }

    /// Skip the queued tasks of a failed attempt.
    pub fn discard_attempt(&self, attempt: u64) {
        self.shared.discarded.lock().insert(attempt);
    }

    /// Skip every queued task from now on.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    /// Tasks submitted whose outcome has not been produced yet.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// True once another submit would go past `SATURATION_PERCENT` of
    /// `max_pending`.
    pub fn is_saturated(&self) -> bool {
        let pending = self.pending();
        pending > 0 && pending * 100 >= self.config.max_pending * SATURATION_PERCENT
    }

    /// Wait until the pending count drops below the saturation mark.
    pub async fn wait_for_capacity(&self) {
        while self.is_saturated() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until every submitted task has produced its outcome.
    pub async fn drain(&self) {
        while self.pending() > 0 {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Outcomes produced so far, without blocking.
    pub fn take_outcomes(&self) -> Vec<AttemptOutcome> {
        self.outcomes.try_iter().collect()
    }

    /// Close the task channel and join every worker off the async runtime.
    pub async fn shutdown(mut self) {
        self.tasks.take();
        let workers = std::mem::take(&mut self.workers);
        let joined = tokio::task::spawn_blocking(move || {
            for worker in workers {
                let _ = worker.join();
            }
        })
        .await;
        if let Err(e) = joined {
            warn!(error = %e, "Hasher workers did not stop cleanly");
        }
        debug!("Hasher pool stopped");
    }
}

impl Drop for HasherPool {
    fn drop(&mut self) {
        // Workers exit once the queue is closed and empty.
        self.tasks.take();
    }
}
