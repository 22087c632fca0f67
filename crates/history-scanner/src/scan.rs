//! Scan records and scan jobs.
//!
//! A [`Scan`] is the persisted outcome of one segment of a scan chain. A
//! [`ScanJob`] is the transient request to perform the next segment, either
//! starting a fresh chain or continuing from the last verified ledger of a
//! previous [`Scan`].

use chrono::{DateTime, Utc};
use henyey_common::{Hash256, Url};
use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// One segment of a scan chain. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scan {
    /// Identifies the chain this segment belongs to.
    pub scan_chain_init_date: DateTime<Utc>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub base_url: Url,
    pub from_ledger: u32,
    pub to_ledger: u32,
    /// Highest ledger verified so far in this chain.
    pub latest_scanned_ledger: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_scanned_ledger_header_hash: Option<Hash256>,
    pub concurrency: usize,
    pub is_slow_archive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ScanError>,
}

impl Scan {
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Whether the chain reached the ledger it was asked to verify.
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.latest_scanned_ledger >= self.to_ledger
    }
}

/// Request to scan one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanJob {
    pub url: Url,
    pub latest_scanned_ledger: u32,
    pub latest_scanned_ledger_header_hash: Option<Hash256>,
    /// Set when continuing a chain; a new chain starts at the scan time.
    pub chain_init_date: Option<DateTime<Utc>>,
    pub from_ledger: Option<u32>,
    pub to_ledger: Option<u32>,
    pub concurrency: Option<usize>,
}

impl ScanJob {
    pub fn new_scan_chain(url: Url) -> Self {
        Self {
            url,
            latest_scanned_ledger: 0,
            latest_scanned_ledger_header_hash: None,
            chain_init_date: None,
            from_ledger: None,
            to_ledger: None,
            concurrency: None,
        }
    }

    /// Pick up where `previous` stopped verifying.
    pub fn continue_scan_chain(previous: &Scan) -> Self {
        Self {
            url: previous.base_url.clone(),
            latest_scanned_ledger: previous.latest_scanned_ledger,
            latest_scanned_ledger_header_hash: previous.latest_scanned_ledger_header_hash,
            chain_init_date: Some(previous.scan_chain_init_date),
            from_ledger: Some(previous.latest_scanned_ledger.saturating_add(1)),
            to_ledger: None,
            concurrency: None,
        }
    }

    pub fn with_from_ledger(mut self, from_ledger: Option<u32>) -> Self {
        if from_ledger.is_some() {
            self.from_ledger = from_ledger;
        }
        self
    }

    pub fn with_to_ledger(mut self, to_ledger: Option<u32>) -> Self {
        self.to_ledger = to_ledger;
        self
    }

    pub fn with_concurrency(mut self, concurrency: Option<usize>) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn is_new_scan_chain(&self) -> bool {
        self.chain_init_date.is_none()
    }
}
