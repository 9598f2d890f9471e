use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A block height, the key of every unit of work.
pub type Height = u64;
/// A block hash, as returned by the source (hex encoded).
pub type BlockHash = String;
/// A transaction id (hex encoded).
pub type Txid = String;

/// Normalized block description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub hash: BlockHash,
    pub height: Height,
    pub timestamp: DateTime<Utc>,
    pub size: u32,
    pub weight: u32,
    pub tx_count: usize,
    pub previous_block_hash: Option<BlockHash>,
    pub merkle_root: String,
    pub nonce: u32,
    pub bits: String,
    pub difficulty: f64,
    pub processed_at: DateTime<Utc>,
}

/// Normalized transaction description.
///
/// It always refers back to its owning block by both hash and height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub txid: Txid,
    pub block_hash: BlockHash,
    pub block_height: Height,
    pub size: u32,
    pub vsize: u32,
    pub weight: u32,
    /// Always `0` for now: input values are not resolved against previous outputs.
    pub fee: i64,
    pub input_count: usize,
    pub output_count: usize,
    pub input_value: i64,
    /// Sum of all outputs, in satoshis.
    pub output_value: i64,
    pub timestamp: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

/// Processing state of a height in the status ledger.
///
/// A height only moves from nothing to [`State::Processing`], then to either [`State::Completed`] or [`State::Failed`].
/// Anything but [`State::Completed`] is picked up again by the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Processing => "processing",
            State::Completed => "completed",
            State::Failed => "failed",
        })
    }
}

/// Durable status row of a height, at most one per height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStatus {
    pub height: Height,
    pub block_hash: BlockHash,
    pub state: State,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl ProcessingStatus {
    /// Create a fresh `processing` row started now.
    pub fn processing(height: Height, block_hash: BlockHash) -> Self {
        Self {
            height,
            block_hash,
            state: State::Processing,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.state == State::Completed
    }
}
