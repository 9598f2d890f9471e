//! Remote chain data source.

use futures::future::BoxFuture;
use thiserror::Error;

use crate::{BlockHash, BlockRecord, Height, TransactionRecord};

pub mod rpc;
pub use rpc::{ConfigError, RpcConfig, RpcSource};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("rpc method {method} timed out")]
    Timeout { method: &'static str },
    #[error("requested height {height} is above the current tip")]
    HeightOutOfRange { height: Height },
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("rpc method {method} returned an empty result")]
    EmptyResult { method: &'static str },
}

/// A fully materialized block: its record and its transactions in source order.
pub type FetchedBlock = (BlockRecord, Vec<TransactionRecord>);

/// Chain data source interface.
///
/// Every call is fallible and may block on I/O; timeouts are the implementor's concern.
pub trait Source: Send + Sync + 'static {
    /// Height of the current chain tip.
    fn best_height(&self) -> BoxFuture<'_, Result<Height, Error>>;

    /// Resolve the hash of the block at `height`.
    ///
    /// Fails with [`Error::HeightOutOfRange`] when `height` is beyond the chain tip.
    fn hash_at(&self, height: Height) -> BoxFuture<'_, Result<BlockHash, Error>>;

    /// Fetch a block and all of its transactions.
    fn fetch_block<'a>(&'a self, hash: &'a str) -> BoxFuture<'a, Result<FetchedBlock, Error>>;
}
