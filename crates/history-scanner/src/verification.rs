//! Ledger-by-ledger verification of a scanned range.
//!
//! While category files stream in, the hasher pool produces three kinds of
//! facts per ledger: the hash of its transaction set, the hash of its result
//! set, and (from the ledger file) the header's own hash together with the
//! hashes the header commits to. [`CategoryVerificationService::verify`]
//! checks that they agree:
//!
//! | check        | expected (from header)       | actual                                |
//! |--------------|------------------------------|---------------------------------------|
//! | transactions | `scpValue.txSetHash`         | hash of the published tx set          |
//! | results      | `txSetResultHash`            | hash of the published result set      |
//! | ledger       | `previousLedgerHash`         | hash of header `ledger - 1`           |
//! | bucket list  | `bucketListHash`             | computed from the checkpoint's HAS    |
//!
//! Ledgers with no transactions have no entry in the transactions and
//! results files, so their expected hashes are those of empty sets.

use std::collections::HashMap;

use henyey_common::Hash256;
use stellar_xdr::curr::{
    GeneralizedTransactionSet, ParallelTxsComponent, TransactionPhase, TransactionSetV1, VecM,
};

use crate::checkpoint::CheckPointFrequency;
use crate::error::VerificationFailure;
use crate::url_builder::Category;

/// First protocol whose transaction sets are generalized.
const GENERALIZED_TX_SET_PROTOCOL: u32 = 20;
/// First protocol whose soroban phase is a parallel component.
const PARALLEL_SOROBAN_PHASE_PROTOCOL: u32 = 23;

/// A ledger number and the hash of its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LedgerHeaderRef {
    pub ledger: u32,
    pub hash: Hash256,
}

/// Hashes a ledger header commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedHashes {
    pub tx_set_hash: Hash256,
    pub tx_set_result_hash: Hash256,
    pub previous_ledger_header_hash: Hash256,
    pub bucket_list_hash: Hash256,
}

/// Everything calculated for one range, keyed by ledger sequence.
#[derive(Debug, Default)]
pub struct CategoryVerificationData {
    pub calculated_tx_set_hashes: HashMap<u32, Hash256>,
    pub calculated_tx_result_hashes: HashMap<u32, Hash256>,
    pub calculated_ledger_header_hashes: HashMap<u32, Hash256>,
    pub protocol_versions: HashMap<u32, u32>,
    pub expected_hashes: HashMap<u32, ExpectedHashes>,
}

impl CategoryVerificationData {
    pub fn is_empty(&self) -> bool {
        self.expected_hashes.is_empty()
    }

    /// Highest ledger whose header was hashed.
    pub fn highest_ledger_header(&self) -> Option<LedgerHeaderRef> {
        self.calculated_ledger_header_hashes
            .iter()
            .max_by_key(|(ledger, _)| **ledger)
            .map(|(ledger, hash)| LedgerHeaderRef {
                ledger: *ledger,
                hash: *hash,
            })
    }
}

/// sha256 of an empty `TransactionResultSet` (a zero-length XDR array).
pub fn zero_xdr_hash() -> Hash256 {
    Hash256::hash(&0u32.to_be_bytes())
}

/// Hash of the transaction set a ledger without transactions carries.
pub fn empty_tx_set_hash(
    ledger: u32,
    protocol_version: u32,
    previous_ledger_hash: &Hash256,
) -> Result<Hash256, stellar_xdr::curr::Error> {
    if ledger == 1 {
        return Ok(Hash256::ZERO);
    }
    if protocol_version < GENERALIZED_TX_SET_PROTOCOL {
        return Ok(Hash256::hash(previous_ledger_hash.as_bytes()));
    }
    let soroban_phase = if protocol_version < PARALLEL_SOROBAN_PHASE_PROTOCOL {
        TransactionPhase::V0(VecM::default())
    } else {
        TransactionPhase::V1(ParallelTxsComponent {
            base_fee: None,
            execution_stages: VecM::default(),
        })
    };
    let set = GeneralizedTransactionSet::V1(TransactionSetV1 {
        previous_ledger_hash: (*previous_ledger_hash).into(),
        phases: vec![TransactionPhase::V0(VecM::default()), soroban_phase].try_into()?,
    });
    Hash256::hash_xdr(&set)
}

/// Pure verification over a range's [`CategoryVerificationData`].
pub struct CategoryVerificationService;

impl CategoryVerificationService {
    /// Check every ledger that has a header in `data`, in ascending order,
    /// and return the first failure.
    ///
    /// Each of `checkpoints` must have a header: a ledger file that ends
    /// early would otherwise skip its checkpoint's bucket list check.
    ///
    /// `previous_header` is the last header verified before this range. When
    /// it is absent the lowest ledger's back-link cannot be checked and is
    /// accepted.
    pub fn verify(
        data: &CategoryVerificationData,
        bucket_list_hashes: &HashMap<u32, Hash256>,
        checkpoints: impl IntoIterator<Item = u32>,
        frequency: CheckPointFrequency,
        previous_header: Option<&LedgerHeaderRef>,
    ) -> Result<(), VerificationFailure> {
        let missing_checkpoint = checkpoints
            .into_iter()
            .filter(|checkpoint| !data.expected_hashes.contains_key(checkpoint))
            .min();
        let missing = |checkpoint: u32| VerificationFailure {
            ledger: checkpoint,
            category: Category::Ledger,
            message: format!("no header found for checkpoint ledger {checkpoint}"),
        };

        let mut ledgers: Vec<u32> = data.expected_hashes.keys().copied().collect();
        ledgers.sort_unstable();
        let Some(&lowest) = ledgers.first() else {
            return missing_checkpoint.map_or(Ok(()), |c| Err(missing(c)));
        };

        for ledger in ledgers {
            if let Some(checkpoint) = missing_checkpoint.filter(|c| *c < ledger) {
                return Err(missing(checkpoint));
            }
            let expected = &data.expected_hashes[&ledger];
            Self::verify_transactions(data, ledger, expected)?;
            Self::verify_results(data, ledger, expected)?;
            Self::verify_previous_header(data, ledger, lowest, expected, previous_header)?;
            if (u64::from(ledger) + 1) % u64::from(frequency.get()) == 0 {
                Self::verify_bucket_list(ledger, expected, bucket_list_hashes)?;
            }
        }
        missing_checkpoint.map_or(Ok(()), |c| Err(missing(c)))
    }

    fn verify_transactions(
        data: &CategoryVerificationData,
        ledger: u32,
        expected: &ExpectedHashes,
    ) -> Result<(), VerificationFailure> {
        let actual = match data.calculated_tx_set_hashes.get(&ledger) {
            Some(hash) => *hash,
            None => {
                let protocol = data.protocol_versions.get(&ledger).copied().unwrap_or(0);
                empty_tx_set_hash(ledger, protocol, &expected.previous_ledger_header_hash)
                    .map_err(|e| VerificationFailure {
                        ledger,
                        category: Category::Transactions,
                        message: format!("cannot encode empty transaction set: {e}"),
                    })?
            }
        };
        if actual != expected.tx_set_hash {
            return Err(VerificationFailure {
                ledger,
                category: Category::Transactions,
                message: format!(
                    "transaction set hash {} does not match header value {}",
                    actual, expected.tx_set_hash
                ),
            });
        }
        Ok(())
    }

    fn verify_results(
        data: &CategoryVerificationData,
        ledger: u32,
        expected: &ExpectedHashes,
    ) -> Result<(), VerificationFailure> {
        let actual = match data.calculated_tx_result_hashes.get(&ledger) {
            Some(hash) => *hash,
            None if ledger == 1 => Hash256::ZERO,
            None => zero_xdr_hash(),
        };
        if actual != expected.tx_set_result_hash {
            return Err(VerificationFailure {
                ledger,
                category: Category::Results,
                message: format!(
                    "result set hash {} does not match header value {}",
                    actual, expected.tx_set_result_hash
                ),
            });
        }
        Ok(())
    }

    fn verify_previous_header(
        data: &CategoryVerificationData,
        ledger: u32,
        lowest: u32,
        expected: &ExpectedHashes,
        previous_header: Option<&LedgerHeaderRef>,
    ) -> Result<(), VerificationFailure> {
        if ledger <= 1 {
            return Ok(());
        }
        let previous = data
            .calculated_ledger_header_hashes
            .get(&(ledger - 1))
            .copied()
            .or_else(|| {
                previous_header
                    .filter(|header| header.ledger == ledger - 1)
                    .map(|header| header.hash)
            });

        match previous {
            Some(hash) if hash == expected.previous_ledger_header_hash => Ok(()),
            Some(hash) => Err(VerificationFailure {
                ledger,
                category: Category::Ledger,
                message: format!(
                    "previous ledger hash {} does not match hash {} of ledger {}",
                    expected.previous_ledger_header_hash,
                    hash,
                    ledger - 1
                ),
            }),
            None if ledger == lowest && previous_header.is_none() => Ok(()),
            None => Err(VerificationFailure {
                ledger,
                category: Category::Ledger,
                message: format!("no header found for previous ledger {}", ledger - 1),
            }),
        }
    }

    fn verify_bucket_list(
        ledger: u32,
        expected: &ExpectedHashes,
        bucket_list_hashes: &HashMap<u32, Hash256>,
    ) -> Result<(), VerificationFailure> {
        match bucket_list_hashes.get(&ledger) {
            Some(hash) if *hash == expected.bucket_list_hash => Ok(()),
            Some(hash) => Err(VerificationFailure {
                ledger,
                category: Category::History,
                message: format!(
                    "bucket list hash {} from HAS does not match header value {}",
                    hash, expected.bucket_list_hash
                ),
            }),
            None => Err(VerificationFailure {
                ledger,
                category: Category::History,
                message: "no HAS bucket list hash for checkpoint".to_string(),
            }),
        }
    }
}
