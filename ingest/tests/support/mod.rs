#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use ingest::dispatch::{self, Dispatcher};
use ingest::progress::{EventKind, ProgressEvent};
use ingest::source::{self, FetchedBlock, Source};
use ingest::store::{self, LocalStore, Store};
use ingest::{BlockHash, BlockRecord, Height, ProcessingStatus, TransactionRecord};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub fn block_hash(height: Height) -> BlockHash {
    format!("{height:064x}")
}

pub fn txid(height: Height, index: usize) -> String {
    format!("{height}:{index}")
}

/// Hold a single height inside `hash_at` until released.
#[derive(Debug, Clone)]
pub struct Gate {
    height: Height,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Gate {
    pub fn new(height: Height) -> Self {
        Self {
            height,
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }

    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// A scripted chain: every height up to `tip` exists and carries one transaction unless told otherwise.
#[derive(Debug)]
pub struct MockSource {
    tip: Height,
    tx_counts: HashMap<Height, usize>,
    hash_failures: HashMap<Height, String>,
    fetch_failures: HashMap<Height, String>,
    gate: Option<Gate>,
    requested: Mutex<Vec<Height>>,
}

impl MockSource {
    pub fn new(tip: Height) -> Self {
        Self {
            tip,
            tx_counts: HashMap::new(),
            hash_failures: HashMap::new(),
            fetch_failures: HashMap::new(),
            gate: None,
            requested: Mutex::new(vec![]),
        }
    }

    pub fn with_tx_count(mut self, height: Height, count: usize) -> Self {
        self.tx_counts.insert(height, count);
        self
    }

    pub fn with_hash_failure(mut self, height: Height, message: &str) -> Self {
        self.hash_failures.insert(height, message.to_owned());
        self
    }

    pub fn with_fetch_failure(mut self, height: Height, message: &str) -> Self {
        self.fetch_failures.insert(height, message.to_owned());
        self
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Heights whose pipeline has been started, in order.
    pub fn requested(&self) -> Vec<Height> {
        self.requested.lock().unwrap().clone()
    }

    pub fn tx_count(&self, height: Height) -> usize {
        self.tx_counts.get(&height).copied().unwrap_or(1)
    }
}

impl Source for MockSource {
    fn best_height(&self) -> BoxFuture<'_, Result<Height, source::Error>> {
        future::ready(Ok(self.tip)).boxed()
    }

    fn hash_at(&self, height: Height) -> BoxFuture<'_, Result<BlockHash, source::Error>> {
        async move {
            self.requested.lock().unwrap().push(height);

            if let Some(gate) = self.gate.as_ref().filter(|gate| gate.height == height) {
                gate.entered.notify_one();
                gate.release.notified().await;
            }

            if let Some(message) = self.hash_failures.get(&height) {
                return Err(source::Error::Rpc {
                    code: -1,
                    message: message.clone(),
                });
            }

            if height > self.tip {
                return Err(source::Error::HeightOutOfRange { height });
            }

            Ok(block_hash(height))
        }
        .boxed()
    }

    fn fetch_block<'a>(&'a self, hash: &'a str) -> BoxFuture<'a, Result<FetchedBlock, source::Error>> {
        async move {
            let height = Height::from_str_radix(hash, 16).unwrap();

            if let Some(message) = self.fetch_failures.get(&height) {
                return Err(source::Error::Rpc {
                    code: -1,
                    message: message.clone(),
                });
            }

            let count = self.tx_count(height);
            let now = Utc::now();

            let transactions = (0..count)
                .map(|index| TransactionRecord {
                    txid: txid(height, index),
                    block_hash: hash.to_owned(),
                    block_height: height,
                    size: 250,
                    vsize: 166,
                    weight: 661,
                    fee: 0,
                    input_count: 1,
                    output_count: 2,
                    input_value: 0,
                    output_value: 100_000,
                    timestamp: DateTime::UNIX_EPOCH,
                    processed_at: now,
                })
                .collect();

            let block = BlockRecord {
                hash: hash.to_owned(),
                height,
                timestamp: DateTime::UNIX_EPOCH,
                size: 1_000,
                weight: 4_000,
                tx_count: count,
                previous_block_hash: height.checked_sub(1).map(block_hash),
                merkle_root: "00".repeat(32),
                nonce: 0,
                bits: "1d00ffff".to_owned(),
                difficulty: 1.0,
                processed_at: now,
            };

            Ok((block, transactions))
        }
        .boxed()
    }
}

/// A [`LocalStore`] wrapper counting record writes and failing on demand.
#[derive(Debug, Default)]
pub struct TestStore {
    pub inner: LocalStore,
    pub fail_completed_heights: bool,
    pub fail_mark_processing: HashSet<Height>,
    pub fail_mark_completed: HashSet<Height>,
    pub fail_mark_failed: bool,
    pub fail_flush: bool,
    /// Fail inserting the transaction with this id.
    pub fail_transaction: Option<String>,
    pub(crate) block_inserts: AtomicUsize,
    pub(crate) transaction_inserts: AtomicUsize,
    pub(crate) flushes: AtomicUsize,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            inner: LocalStore::in_memory(),
            ..Default::default()
        }
    }

    /// Mark every height of `heights` as completed.
    pub async fn with_completed(self, heights: impl IntoIterator<Item = Height>) -> Self {
        for height in heights {
            self.inner.mark_processing(height, &block_hash(height)).await.unwrap();
            self.inner.mark_completed(height).await.unwrap();
        }
        self
    }

    pub fn block_inserts(&self) -> usize {
        self.block_inserts.load(Ordering::SeqCst)
    }

    pub fn transaction_inserts(&self) -> usize {
        self.transaction_inserts.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub async fn status_of(&self, height: Height) -> Option<ProcessingStatus> {
        self.inner.status(height).await.unwrap()
    }
}

fn backend<T: Send + 'static>(what: &str) -> BoxFuture<'static, Result<T, store::Error>> {
    future::ready(Err(store::Error::Backend(what.to_owned()))).boxed()
}

impl Store for TestStore {
    fn completed_heights(&self, range: RangeInclusive<Height>) -> BoxFuture<'_, Result<BTreeSet<Height>, store::Error>> {
        if self.fail_completed_heights {
            return backend("connection refused");
        }
        self.inner.completed_heights(range)
    }

    fn mark_processing<'a>(&'a self, height: Height, block_hash: &'a str) -> BoxFuture<'a, Result<(), store::Error>> {
        if self.fail_mark_processing.contains(&height) {
            return backend("database is locked");
        }
        self.inner.mark_processing(height, block_hash)
    }

    fn mark_completed(&self, height: Height) -> BoxFuture<'_, Result<(), store::Error>> {
        if self.fail_mark_completed.contains(&height) {
            return backend("disk full");
        }
        self.inner.mark_completed(height)
    }

    fn mark_failed<'a>(&'a self, height: Height, message: &'a str) -> BoxFuture<'a, Result<(), store::Error>> {
        if self.fail_mark_failed {
            return backend("disk full");
        }
        self.inner.mark_failed(height, message)
    }

    fn insert_block<'a>(&'a self, block: &'a BlockRecord) -> BoxFuture<'a, Result<(), store::Error>> {
        self.block_inserts.fetch_add(1, Ordering::SeqCst);
        self.inner.insert_block(block)
    }

    fn insert_transaction<'a>(&'a self, transaction: &'a TransactionRecord) -> BoxFuture<'a, Result<(), store::Error>> {
        if self.fail_transaction.as_deref() == Some(transaction.txid.as_str()) {
            return backend("constraint violation");
        }
        self.transaction_inserts.fetch_add(1, Ordering::SeqCst);
        self.inner.insert_transaction(transaction)
    }

    fn insert_transactions<'a>(&'a self, transactions: &'a [TransactionRecord]) -> BoxFuture<'a, Result<(), store::Error>> {
        self.transaction_inserts.fetch_add(transactions.len(), Ordering::SeqCst);
        self.inner.insert_transactions(transactions)
    }

    fn status(&self, height: Height) -> BoxFuture<'_, Result<Option<ProcessingStatus>, store::Error>> {
        self.inner.status(height)
    }

    fn max_completed_height(&self) -> BoxFuture<'_, Result<Option<Height>, store::Error>> {
        self.inner.max_completed_height()
    }

    fn flush(&self) -> BoxFuture<'_, Result<(), store::Error>> {
        if self.fail_flush {
            return backend("read-only file system");
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.inner.flush()
    }
}

/// Run `dispatcher` while draining its event stream, returning both outcomes.
pub async fn run_to_end<S: Source, T: Store>(
    mut dispatcher: Dispatcher<S, T>,
    cancel: CancellationToken,
) -> (Result<(), dispatch::Error>, Vec<ProgressEvent>) {
    let events = dispatcher.events().unwrap();
    let run = tokio::spawn(dispatcher.run(cancel));

    let events = events.drain().await;

    (run.await.unwrap(), events)
}

/// Heights of the terminal events, sorted.
pub fn terminal_heights(events: &[ProgressEvent]) -> Vec<Height> {
    let mut heights = events
        .iter()
        .filter(|event| event.kind.is_terminal())
        .filter_map(|event| event.height)
        .collect::<Vec<_>>();
    heights.sort_unstable();
    heights
}

pub fn of_kind(events: &[ProgressEvent], kind: EventKind) -> Vec<&ProgressEvent> {
    events.iter().filter(|event| event.kind == kind).collect()
}
