use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::{fs, io, sync::Mutex};

use super::{Error, Store};
use crate::{BlockHash, BlockRecord, Height, ProcessingStatus, State, TransactionRecord, Txid};

// A block usually carries a few thousand transactions, reserve accordingly.
const DEFAULT_CAPACITY: usize = 4_096;
const TEMP_EXT: &str = "tmp";

/// Everything a [`LocalStore`] keeps, as serialized into its snapshot file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Ledger {
    statuses: BTreeMap<Height, ProcessingStatus>,
    blocks: HashMap<BlockHash, BlockRecord>,
    transactions: HashMap<Txid, TransactionRecord>,
}

impl Ledger {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            statuses: BTreeMap::new(),
            blocks: HashMap::with_capacity(capacity / 1_024),
            transactions: HashMap::with_capacity(capacity),
        }
    }
}

/// Local store.
///
/// An in-memory ledger protected for concurrent R/W access, optionally backed by a JSON snapshot file in the local
/// storage. The snapshot is only written on [`Store::flush()`], through a temporary file atomically renamed over
/// the previous snapshot, so that a crash while flushing never leaves a truncated snapshot behind:
///
/// ```text
///     - {path}       last complete snapshot
///     - {path}.tmp   partial snapshot being written, discarded on open
/// ```
#[derive(Debug, Default)]
pub struct LocalStore {
    /// The snapshot path, if any.
    path: Option<PathBuf>,
    ledger: RwLock<Ledger>,
    /// Serializes concurrent flushes sharing the same temporary file.
    flushing: Mutex<()>,
}

impl LocalStore {
    /// Create a store that lives in memory only.
    pub fn in_memory() -> Self {
        Self {
            ledger: RwLock::new(Ledger::with_capacity(DEFAULT_CAPACITY)),
            ..Default::default()
        }
    }

    /// Open a store backed by the snapshot at `path`, loading it when it exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let tmp = path.with_extension(TEMP_EXT);

        if fs::try_exists(&tmp).await? {
            tracing::trace!("Clean incomplete snapshot from local storage: `{}`", tmp.display());

            fs::remove_file(&tmp).await?;
        }

        let ledger = match fs::read(&path).await {
            Ok(bytes) => {
                tracing::debug!("Populate ledger from local storage: `{}`", path.display());

                serde_json::from_slice(&bytes)?
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ledger::with_capacity(DEFAULT_CAPACITY),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path: Some(path),
            ledger: RwLock::new(ledger),
            flushing: Mutex::new(()),
        })
    }

    #[inline]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn block_count(&self) -> Result<usize, Error> {
        Ok(self.read()?.blocks.len())
    }

    pub fn transaction_count(&self) -> Result<usize, Error> {
        Ok(self.read()?.transactions.len())
    }

    pub fn block(&self, hash: &str) -> Result<Option<BlockRecord>, Error> {
        Ok(self.read()?.blocks.get(hash).cloned())
    }

    pub fn transaction(&self, txid: &str) -> Result<Option<TransactionRecord>, Error> {
        Ok(self.read()?.transactions.get(txid).cloned())
    }

    #[inline]
    fn read(&self) -> Result<RwLockReadGuard<'_, Ledger>, Error> {
        self.ledger.read().map_err(|_| Error::Poisoned)
    }

    #[inline]
    fn write(&self) -> Result<RwLockWriteGuard<'_, Ledger>, Error> {
        self.ledger.write().map_err(|_| Error::Poisoned)
    }

    /// Move the existing row of `height` to a terminal `state`.
    fn finish(&self, height: Height, state: State, message: Option<&str>) -> Result<(), Error> {
        let mut ledger = self.write()?;
        let status = ledger.statuses.get_mut(&height).ok_or(Error::UnknownHeight(height))?;

        status.state = state;
        status.completed_at = Some(Utc::now());
        status.error_message = message.map(str::to_owned);

        Ok(())
    }
}

impl Store for LocalStore {
    fn completed_heights(&self, range: RangeInclusive<Height>) -> BoxFuture<'_, Result<BTreeSet<Height>, Error>> {
        async move {
            let ledger = self.read()?;

            Ok(ledger
                .statuses
                .range(range)
                .filter_map(|(&height, status)| status.is_completed().then_some(height))
                .collect())
        }
        .boxed()
    }

    fn mark_processing<'a>(&'a self, height: Height, block_hash: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let status = ProcessingStatus::processing(height, block_hash.to_owned());

            self.write()?.statuses.insert(height, status);

            Ok(())
        }
        .boxed()
    }

    fn mark_completed(&self, height: Height) -> BoxFuture<'_, Result<(), Error>> {
        async move { self.finish(height, State::Completed, None) }.boxed()
    }

    fn mark_failed<'a>(&'a self, height: Height, message: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        async move { self.finish(height, State::Failed, Some(message)) }.boxed()
    }

    fn insert_block<'a>(&'a self, block: &'a BlockRecord) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            self.write()?.blocks.entry(block.hash.clone()).or_insert_with(|| block.clone());

            Ok(())
        }
        .boxed()
    }

    fn insert_transaction<'a>(&'a self, transaction: &'a TransactionRecord) -> BoxFuture<'a, Result<(), Error>> {
        self.insert_transactions(std::slice::from_ref(transaction))
    }

    fn insert_transactions<'a>(&'a self, transactions: &'a [TransactionRecord]) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            // a single write access makes the whole batch visible at once
            let mut ledger = self.write()?;

            for transaction in transactions {
                ledger
                    .transactions
                    .entry(transaction.txid.clone())
                    .or_insert_with(|| transaction.clone());
            }

            Ok(())
        }
        .boxed()
    }

    fn status(&self, height: Height) -> BoxFuture<'_, Result<Option<ProcessingStatus>, Error>> {
        async move { Ok(self.read()?.statuses.get(&height).cloned()) }.boxed()
    }

    /// Write the current ledger to the local storage. This is a no-op for in-memory stores.
    fn flush(&self) -> BoxFuture<'_, Result<(), Error>> {
        use io::AsyncWriteExt;

        async move {
            let Some(path) = self.path.as_deref() else {
                return Ok(());
            };

            let _guard = self.flushing.lock().await;

            let bytes = serde_json::to_vec(&*self.read()?)?;
            let tmp = path.with_extension(TEMP_EXT);

            tracing::trace!("Flushing {} bytes ledger to local storage: `{}`", bytes.len(), path.display());

            let mut writer = io::BufWriter::new(fs::File::create(&tmp).await?);

            writer.write_all(&bytes).await?;
            writer.shutdown().await?;
            writer.into_inner().sync_all().await?;

            fs::rename(&tmp, path).await?;

            Ok(())
        }
        .boxed()
    }

    fn max_completed_height(&self) -> BoxFuture<'_, Result<Option<Height>, Error>> {
        async move {
            let ledger = self.read()?;

            Ok(ledger.statuses.values().rev().find(|status| status.is_completed()).map(|status| status.height))
        }
        .boxed()
    }
}
