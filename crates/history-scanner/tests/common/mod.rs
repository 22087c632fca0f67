//! A generated history archive served over HTTP.
//!
//! The archive holds ledgers `1..=last_checkpoint` at protocol 19 with a
//! correct header hash chain. Every ledger ending in 5 carries one
//! transaction; all others are empty. Each checkpoint's HAS references one
//! bucket of its own plus one bucket shared by every checkpoint.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{StatusCode, Uri},
    routing::get,
    Router,
};
use flate2::{write::GzEncoder, Compression};
use henyey_common::{Hash256, Url};
use henyey_history_scanner::{
    Category, CheckPointGenerator, HASBucketLevel, HistoryArchiveState, UrlBuilder,
};
use parking_lot::Mutex;
use stellar_xdr::curr::{
    BumpSequenceOp, Hash, LedgerHeader, LedgerHeaderExt, LedgerHeaderHistoryEntry,
    LedgerHeaderHistoryEntryExt, Limits, Memo, MuxedAccount, Operation, OperationBody,
    Preconditions, SequenceNumber, StellarValue, StellarValueExt, TimePoint, Transaction,
    TransactionEnvelope, TransactionExt, TransactionHistoryEntry, TransactionHistoryEntryExt,
    TransactionHistoryResultEntry, TransactionHistoryResultEntryExt, TransactionResult,
    TransactionResultExt, TransactionResultPair, TransactionResultResult, TransactionResultSet,
    TransactionSet, TransactionV1Envelope, Uint256, VecM, WriteXdr,
};
use tokio::net::TcpListener;

pub const PROTOCOL_VERSION: u32 = 19;
const BUCKET_LEVELS: usize = 11;

pub fn gzip_bytes(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

/// Concatenate records, each behind an RFC 5531 record mark.
pub fn record_marked(records: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        let mark = record.len() as u32 | 0x8000_0000;
        out.extend_from_slice(&mark.to_be_bytes());
        out.extend_from_slice(record);
    }
    out
}

fn has_transaction(ledger: u32) -> bool {
    ledger % 10 == 5
}

fn envelope(ledger: u32, fee: u32) -> TransactionEnvelope {
    TransactionEnvelope::Tx(TransactionV1Envelope {
        tx: Transaction {
            source_account: MuxedAccount::Ed25519(Uint256([7; 32])),
            fee,
            seq_num: SequenceNumber(i64::from(ledger)),
            cond: Preconditions::None,
            memo: Memo::None,
            operations: vec![Operation {
                source_account: None,
                body: OperationBody::BumpSequence(BumpSequenceOp {
                    bump_to: SequenceNumber(i64::from(ledger) + 1),
                }),
            }]
            .try_into()
            .expect("operations"),
            ext: TransactionExt::V0,
        },
        signatures: VecM::default(),
    })
}

fn classic_tx_set_hash(set: &TransactionSet) -> Hash256 {
    let mut bytes = set.previous_ledger_hash.0.to_vec();
    for tx in set.txs.iter() {
        bytes.extend(tx.to_xdr(Limits::none()).expect("envelope xdr"));
    }
    Hash256::hash(&bytes)
}

fn level(curr: String) -> HASBucketLevel {
    HASBucketLevel {
        curr,
        snap: "0".repeat(64),
        next: Default::default(),
    }
}

pub fn bucket_content(name: &str) -> Vec<u8> {
    format!("bucket entries of {name}").into_bytes()
}

/// All files of a generated archive, keyed by path below the archive root.
#[derive(Debug, Clone)]
pub struct FixtureArchive {
    pub files: HashMap<String, Vec<u8>>,
    pub header_hashes: BTreeMap<u32, Hash256>,
    pub bucket_hashes: Vec<Hash256>,
    pub last_checkpoint: u32,
    transactions: BTreeMap<u32, TransactionHistoryEntry>,
    ledger_records: BTreeMap<u32, Vec<Vec<u8>>>,
}

impl FixtureArchive {
    pub fn build(last_checkpoint: u32) -> Self {
        let generator = CheckPointGenerator::default();
        let shared_bucket = Hash256::hash(&bucket_content("shared"));
        let mut files = HashMap::new();
        let mut header_hashes = BTreeMap::new();
        let mut transactions = BTreeMap::new();
        let mut all_ledger_records = BTreeMap::new();
        let mut bucket_hashes = vec![shared_bucket];
        files.insert(
            UrlBuilder::bucket_path(&shared_bucket),
            gzip_bytes(&bucket_content("shared")),
        );

        let mut previous_hash = Hash256::ZERO;
        let mut ledger = 1;
        for checkpoint in generator.generate(0, last_checkpoint) {
            let own_bucket_name = format!("checkpoint {checkpoint}");
            let own_bucket = Hash256::hash(&bucket_content(&own_bucket_name));
            bucket_hashes.push(own_bucket);
            files.insert(
                UrlBuilder::bucket_path(&own_bucket),
                gzip_bytes(&bucket_content(&own_bucket_name)),
            );

            let mut current_buckets = vec![level(own_bucket.to_hex()), level(shared_bucket.to_hex())];
            current_buckets.resize_with(BUCKET_LEVELS, || level("0".repeat(64)));
            let has = HistoryArchiveState {
                version: 1,
                server: Some("fixture".to_string()),
                current_ledger: checkpoint,
                network_passphrase: None,
                current_buckets,
                hot_archive_buckets: None,
            };
            let bucket_list_hash = has.bucket_list_hash().expect("bucket list hash");
            files.insert(
                UrlBuilder::checkpoint_path(Category::History, checkpoint),
                has.to_json().expect("has json").into_bytes(),
            );
            if checkpoint == last_checkpoint {
                files.insert(
                    henyey_history_scanner::url_builder::ROOT_HAS_PATH.to_string(),
                    has.to_json().expect("has json").into_bytes(),
                );
            }

            let mut ledger_records = Vec::new();
            let mut tx_records = Vec::new();
            let mut result_records = Vec::new();
            while ledger <= checkpoint {
                let (tx_set_hash, result_hash) = if has_transaction(ledger) {
                    let entry = TransactionHistoryEntry {
                        ledger_seq: ledger,
                        tx_set: TransactionSet {
                            previous_ledger_hash: previous_hash.into(),
                            txs: vec![envelope(ledger, 100)].try_into().expect("txs"),
                        },
                        ext: TransactionHistoryEntryExt::V0,
                    };
                    let results = TransactionResultSet {
                        results: vec![TransactionResultPair {
                            transaction_hash: Hash([ledger as u8; 32]),
                            result: TransactionResult {
                                fee_charged: 100,
                                result: TransactionResultResult::TxSuccess(VecM::default()),
                                ext: TransactionResultExt::V0,
                            },
                        }]
                        .try_into()
                        .expect("results"),
                    };
                    let tx_set_hash = classic_tx_set_hash(&entry.tx_set);
                    let result_hash = Hash256::hash_xdr(&results).expect("results xdr");
                    tx_records.push(entry.to_xdr(Limits::none()).expect("tx entry xdr"));
                    result_records.push(
                        TransactionHistoryResultEntry {
                            ledger_seq: ledger,
                            tx_result_set: results,
                            ext: TransactionHistoryResultEntryExt::V0,
                        }
                        .to_xdr(Limits::none())
                        .expect("result entry xdr"),
                    );
                    transactions.insert(ledger, entry);
                    (tx_set_hash, result_hash)
                } else if ledger == 1 {
                    (Hash256::ZERO, Hash256::ZERO)
                } else {
                    (
                        Hash256::hash(previous_hash.as_bytes()),
                        Hash256::hash(&0u32.to_be_bytes()),
                    )
                };

                let header = LedgerHeader {
                    ledger_version: PROTOCOL_VERSION,
                    previous_ledger_hash: previous_hash.into(),
                    scp_value: StellarValue {
                        tx_set_hash: tx_set_hash.into(),
                        close_time: TimePoint(1_600_000_000 + u64::from(ledger) * 5),
                        upgrades: VecM::default(),
                        ext: StellarValueExt::Basic,
                    },
                    tx_set_result_hash: result_hash.into(),
                    bucket_list_hash: bucket_list_hash.into(),
                    ledger_seq: ledger,
                    total_coins: 1_000_000_000,
                    fee_pool: 0,
                    inflation_seq: 0,
                    id_pool: 0,
                    base_fee: 100,
                    base_reserve: 5_000_000,
                    max_tx_set_size: 100,
                    skip_list: [Hash([0; 32]), Hash([0; 32]), Hash([0; 32]), Hash([0; 32])],
                    ext: LedgerHeaderExt::V0,
                };
                let hash = Hash256::hash_xdr(&header).expect("header xdr");
                ledger_records.push(
                    LedgerHeaderHistoryEntry {
                        hash: hash.into(),
                        header,
                        ext: LedgerHeaderHistoryEntryExt::V0,
                    }
                    .to_xdr(Limits::none())
                    .expect("header entry xdr"),
                );
                header_hashes.insert(ledger, hash);
                previous_hash = hash;
                ledger += 1;
            }

            files.insert(
                UrlBuilder::checkpoint_path(Category::Ledger, checkpoint),
                gzip_bytes(&record_marked(&ledger_records)),
            );
            all_ledger_records.insert(checkpoint, ledger_records);
            files.insert(
                UrlBuilder::checkpoint_path(Category::Transactions, checkpoint),
                gzip_bytes(&record_marked(&tx_records)),
            );
            files.insert(
                UrlBuilder::checkpoint_path(Category::Results, checkpoint),
                gzip_bytes(&record_marked(&result_records)),
            );
        }

        Self {
            files,
            header_hashes,
            bucket_hashes,
            last_checkpoint,
            transactions,
            ledger_records: all_ledger_records,
        }
    }

    /// Rewrite `checkpoint`'s ledger file without its last `count` headers.
    pub fn truncate_ledger_file(&mut self, checkpoint: u32, count: usize) {
        let records = &self.ledger_records[&checkpoint];
        let kept = &records[..records.len() - count];
        self.files.insert(
            UrlBuilder::checkpoint_path(Category::Ledger, checkpoint),
            gzip_bytes(&record_marked(kept)),
        );
    }

    /// Change the fee of `ledger`'s transaction so its set no longer hashes
    /// to what the header says. `ledger` must end in 5.
    pub fn tamper_transaction_set(&mut self, ledger: u32) {
        let entry = self.transactions.get_mut(&ledger).expect("ledger has a transaction");
        entry.tx_set.txs = vec![envelope(ledger, 999)].try_into().expect("txs");

        let checkpoint = CheckPointGenerator::default().closest_higher_checkpoint(ledger);
        let first = checkpoint + 1 - 64;
        let records: Vec<Vec<u8>> = self
            .transactions
            .range(first..=checkpoint)
            .map(|(_, entry)| entry.to_xdr(Limits::none()).expect("tx entry xdr"))
            .collect();
        self.files.insert(
            UrlBuilder::checkpoint_path(Category::Transactions, checkpoint),
            gzip_bytes(&record_marked(&records)),
        );
    }

    pub fn checkpoint_path(&self, category: Category, checkpoint: u32) -> String {
        UrlBuilder::checkpoint_path(category, checkpoint)
    }
}

/// Shared state of a running fixture server.
#[derive(Default)]
pub struct ServerState {
    files: Mutex<HashMap<String, Vec<u8>>>,
    /// One-off responses served before the real file.
    overrides: Mutex<HashMap<String, VecDeque<(StatusCode, Vec<u8>)>>>,
    requests: Mutex<Vec<String>>,
}

/// Handle on a fixture archive served from `127.0.0.1`.
pub struct FixtureServer {
    pub url: Url,
    state: Arc<ServerState>,
}

impl FixtureServer {
    /// Serve `files` on an ephemeral port.
    pub async fn start(files: HashMap<String, Vec<u8>>) -> Self {
        let state = Arc::new(ServerState {
            files: Mutex::new(files),
            ..Default::default()
        });
        let app = Router::new()
            .route("/*path", get(serve_file))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let url = Url::new(&format!("http://{addr}")).expect("url");
        Self { url, state }
    }

    pub async fn start_archive(archive: &FixtureArchive) -> Self {
        Self::start(archive.files.clone()).await
    }

    /// Answer the next requests for `path` with `statuses`, in order.
    pub fn fail_with(&self, path: &str, statuses: &[StatusCode]) {
        self.state
            .overrides
            .lock()
            .entry(path.to_string())
            .or_default()
            .extend(statuses.iter().map(|status| (*status, Vec::new())));
    }

    /// Answer the next request for `path` with `body` instead of the file.
    pub fn serve_once(&self, path: &str, body: Vec<u8>) {
        self.state
            .overrides
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back((StatusCode::OK, body));
    }

    pub fn remove(&self, path: &str) {
        self.state.files.lock().remove(path);
    }

    pub fn replace(&self, path: &str, body: Vec<u8>) {
        self.state.files.lock().insert(path.to_string(), body);
    }

    /// Every request URI seen so far, including query strings.
    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().clone()
    }

    pub fn request_count(&self, path: &str) -> usize {
        let prefix = format!("/{path}");
        self.state
            .requests
            .lock()
            .iter()
            .filter(|uri| uri.split('?').next() == Some(prefix.as_str()))
            .count()
    }
}

async fn serve_file(
    State(state): State<Arc<ServerState>>,
    Path(path): Path<String>,
    uri: Uri,
) -> (StatusCode, Vec<u8>) {
    state.requests.lock().push(uri.to_string());
    if let Some(response) = state
        .overrides
        .lock()
        .get_mut(&path)
        .and_then(|responses| responses.pop_front())
    {
        return response;
    }
    match state.files.lock().get(&path) {
        Some(body) => (StatusCode::OK, body.clone()),
        None => (StatusCode::NOT_FOUND, Vec::new()),
    }
}
