//! History Archive State (HAS) parsing, validation and derived hashes.
//!
//! A HAS file is published for every checkpoint (and once more as the root
//! `.well-known/stellar-history.json`). It lists the bucket list levels that
//! make up ledger state at that checkpoint:
//!
//! ```json
//! {
//!   "version": 1,
//!   "server": "stellar-core 21.0.0",
//!   "currentLedger": 127,
//!   "currentBuckets": [
//!     { "curr": "ab12...", "snap": "0000...", "next": { "state": 0 } }
//!   ]
//! }
//! ```
//!
//! A hash made only of `0` digits marks an empty slot and never names a
//! bucket file.

use std::collections::HashSet;

use henyey_common::{Hash256, Sha256Hasher};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a HAS document was rejected.
#[derive(Debug, Error)]
pub enum HasError {
    #[error("malformed HAS JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported HAS version {0}")]
    UnsupportedVersion(u32),

    #[error("HAS lists no bucket levels")]
    NoBuckets,

    #[error("invalid hash in {field}: '{value}'")]
    InvalidHash { field: String, value: String },

    #[error("HAS currentLedger {actual} does not match checkpoint {expected}")]
    LedgerMismatch { expected: u32, actual: u32 },
}

/// Parsed HAS document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryArchiveState {
    pub version: u32,

    #[serde(default)]
    pub server: Option<String>,

    pub current_ledger: u32,

    #[serde(default)]
    pub network_passphrase: Option<String>,

    pub current_buckets: Vec<HASBucketLevel>,

    /// Hot archive bucket list, published from protocol 23.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hot_archive_buckets: Option<Vec<HASBucketLevel>>,
}

/// One bucket list level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HASBucketLevel {
    pub curr: String,
    pub snap: String,
    #[serde(default)]
    pub next: HASBucketNext,
}

/// A level's pending merge. `output` is set once the merge finished
/// (`state == 1`); `curr`/`snap` are the inputs of a running merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HASBucketNext {
    pub state: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snap: Option<String>,
}

/// True when every digit is `0`; such values mark unused slots.
pub fn is_zero_hash(hex: &str) -> bool {
    hex.bytes().all(|b| b == b'0')
}

fn parse_nonzero_hash(hex: &str) -> Option<Hash256> {
    if is_zero_hash(hex) {
        return None;
    }
    Hash256::from_hex(hex).ok()
}

fn check_hash(field: String, value: &str) -> Result<(), HasError> {
    let valid = value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit());
    if valid {
        Ok(())
    } else {
        Err(HasError::InvalidHash {
            field,
            value: value.to_string(),
        })
    }
}

fn check_levels(name: &str, levels: &[HASBucketLevel]) -> Result<(), HasError> {
    for (i, level) in levels.iter().enumerate() {
        check_hash(format!("{name}[{i}].curr"), &level.curr)?;
        check_hash(format!("{name}[{i}].snap"), &level.snap)?;
        if let Some(output) = &level.next.output {
            check_hash(format!("{name}[{i}].next.output"), output)?;
        }
    }
    Ok(())
}

fn collect_nonzero(levels: &[HASBucketLevel], out: &mut HashSet<Hash256>) {
    for level in levels {
        let next_output = level.next.output.as_deref();
        for hex in [Some(level.curr.as_str()), Some(level.snap.as_str()), next_output]
            .into_iter()
            .flatten()
        {
            if let Some(hash) = parse_nonzero_hash(hex) {
                out.insert(hash);
            }
        }
    }
}

/// sha256 over the concatenated `sha256(curr || snap)` of each level.
/// Zero hashes take part as 32 zero bytes.
fn levels_hash(levels: &[HASBucketLevel]) -> Result<Hash256, HasError> {
    let mut list = Sha256Hasher::new();
    for (i, level) in levels.iter().enumerate() {
        let curr = Hash256::from_hex(&level.curr).map_err(|_| HasError::InvalidHash {
            field: format!("level[{i}].curr"),
            value: level.curr.clone(),
        })?;
        let snap = Hash256::from_hex(&level.snap).map_err(|_| HasError::InvalidHash {
            field: format!("level[{i}].snap"),
            value: level.snap.clone(),
        })?;
        let mut level_hasher = Sha256Hasher::new();
        level_hasher.update(curr.as_bytes());
        level_hasher.update(snap.as_bytes());
        list.update(level_hasher.finalize().as_bytes());
    }
    Ok(list.finalize())
}

impl HistoryArchiveState {
    pub fn from_json(json: &str) -> Result<Self, HasError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, HasError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Result<String, HasError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Schema checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), HasError> {
        if !(1..=2).contains(&self.version) {
            return Err(HasError::UnsupportedVersion(self.version));
        }
        if self.current_buckets.is_empty() {
            return Err(HasError::NoBuckets);
        }
        check_levels("currentBuckets", &self.current_buckets)?;
        if let Some(hot) = &self.hot_archive_buckets {
            check_levels("hotArchiveBuckets", hot)?;
        }
        Ok(())
    }

    /// [`validate`](Self::validate) plus a check that the file describes
    /// the checkpoint it was fetched for.
    pub fn validate_for_checkpoint(&self, checkpoint: u32) -> Result<(), HasError> {
        self.validate()?;
        if self.current_ledger != checkpoint {
            return Err(HasError::LedgerMismatch {
                expected: checkpoint,
                actual: self.current_ledger,
            });
        }
        Ok(())
    }

    /// Every bucket this state references: `curr`, `snap` and finished
    /// `next.output` of each level, live and hot, minus empty slots.
    pub fn non_zero_bucket_hashes(&self) -> HashSet<Hash256> {
        let mut hashes = HashSet::new();
        collect_nonzero(&self.current_buckets, &mut hashes);
        if let Some(hot) = &self.hot_archive_buckets {
            collect_nonzero(hot, &mut hashes);
        }
        hashes
    }

    pub fn has_hot_archive_buckets(&self) -> bool {
        self.hot_archive_buckets
            .as_ref()
            .is_some_and(|levels| !levels.is_empty())
    }

    /// The bucket list hash a ledger header at this checkpoint must carry.
    ///
    /// With a hot archive the header commits to `sha256(live || hot)`.
    pub fn bucket_list_hash(&self) -> Result<Hash256, HasError> {
        let live = levels_hash(&self.current_buckets)?;
        match &self.hot_archive_buckets {
            Some(hot) if !hot.is_empty() => {
                let hot = levels_hash(hot)?;
                let mut combined = Sha256Hasher::new();
                combined.update(live.as_bytes());
                combined.update(hot.as_bytes());
                Ok(combined.finalize())
            }
            _ => Ok(live),
        }
    }
}
