//! Block, transaction and status ledger persistence.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use futures::future::{self, BoxFuture, FutureExt};
use thiserror::Error;

use crate::{BlockRecord, Height, ProcessingStatus, TransactionRecord};

pub mod local;
pub use local::LocalStore;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("no status recorded for block {0}")]
    UnknownHeight(Height),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Persistence interface.
///
/// Implementors must tolerate concurrent calls from every worker. Record writes are insert-or-ignore: writing an
/// already persisted block or transaction again is a no-op, not an error.
pub trait Store: Send + Sync + 'static {
    /// Heights within `range` whose status is `completed`.
    fn completed_heights(&self, range: RangeInclusive<Height>) -> BoxFuture<'_, Result<BTreeSet<Height>, Error>>;

    /// Record `height` as `processing` for `block_hash`, starting now.
    ///
    /// Any previous row for this height is replaced.
    fn mark_processing<'a>(&'a self, height: Height, block_hash: &'a str) -> BoxFuture<'a, Result<(), Error>>;

    /// Record `height` as `completed`, keeping its start time.
    fn mark_completed(&self, height: Height) -> BoxFuture<'_, Result<(), Error>>;

    /// Record `height` as `failed` with `message`.
    fn mark_failed<'a>(&'a self, height: Height, message: &'a str) -> BoxFuture<'a, Result<(), Error>>;

    fn insert_block<'a>(&'a self, block: &'a BlockRecord) -> BoxFuture<'a, Result<(), Error>>;

    fn insert_transaction<'a>(&'a self, transaction: &'a TransactionRecord) -> BoxFuture<'a, Result<(), Error>>;

    /// Insert a batch of transactions, all or nothing.
    fn insert_transactions<'a>(&'a self, transactions: &'a [TransactionRecord]) -> BoxFuture<'a, Result<(), Error>>;

    /// Status row of `height`, if any.
    fn status(&self, height: Height) -> BoxFuture<'_, Result<Option<ProcessingStatus>, Error>>;

    /// Highest completed height, if any.
    fn max_completed_height(&self) -> BoxFuture<'_, Result<Option<Height>, Error>>;

    /// Make every write so far durable.
    ///
    /// Stores persisting each write on its own have nothing to do here.
    fn flush(&self) -> BoxFuture<'_, Result<(), Error>> {
        future::ready(Ok(())).boxed()
    }
}
