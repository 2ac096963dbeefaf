//! Data structures shared by the listener core, the chain adapters and the
//! binary.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::ClientError;

/// Opaque identifier distinguishing one monitored network from another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainId(u64);

impl ChainId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for ChainId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChainId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Length in bytes of a transaction hash.
pub const TX_HASH_BYTES: usize = 32;

/// Errors emitted when a transaction hash fails validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxHashError {
    #[error("transaction hash must start with 0x")]
    MissingPrefix,
    #[error("transaction hash must be {TX_HASH_BYTES} bytes, got {0}")]
    WrongLength(usize),
    #[error("transaction hash contains non-hex characters")]
    NonHex,
}

/// Lower-cased, `0x`-prefixed 32-byte transaction hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxHash(String);

impl TxHash {
    pub fn parse(value: &str) -> Result<Self, TxHashError> {
        let digits = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .ok_or(TxHashError::MissingPrefix)?;
        let bytes = hex::decode(digits).map_err(|_| TxHashError::NonHex)?;
        if bytes.len() != TX_HASH_BYTES {
            return Err(TxHashError::WrongLength(bytes.len()));
        }
        Ok(Self(format!("0x{}", hex::encode(bytes))))
    }

    /// Builds a hash from raw bytes, used by adapters and test doubles.
    pub fn from_bytes(bytes: [u8; TX_HASH_BYTES]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TxHash {
    type Error = TxHashError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TxHash> for String {
    fn from(value: TxHash) -> Self {
        value.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Next block to fetch and, for that first block only, the first transaction
/// index to process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub block_number: u64,
    pub tx_index: u64,
}

impl Position {
    pub const fn new(block_number: u64, tx_index: u64) -> Self {
        Self {
            block_number,
            tx_index,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.block_number, self.tx_index)
    }
}

/// A mined block and its ordered transaction hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
    pub transactions: Vec<TxHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
}

/// Execution outcome of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub transaction_index: u64,
    pub block_number: u64,
    pub block_hash: String,
    /// `Some(true)` for success; pre-Byzantium receipts carry no status.
    pub status: Option<bool>,
    pub gas_used: u64,
    pub contract_address: Option<String>,
    pub logs_count: usize,
}

/// Block event surfaced on the merged Blocks stream.
#[derive(Debug, Clone)]
pub struct ListenedBlock {
    pub chain_id: ChainId,
    pub block: Arc<Block>,
    pub observed_at: DateTime<Utc>,
}

/// Receipt event surfaced on the merged Receipts stream.
#[derive(Debug, Clone)]
pub struct ListenedReceipt {
    pub chain_id: ChainId,
    pub block_number: u64,
    pub block_hash: String,
    pub tx_index: u64,
    pub receipt: Receipt,
}

impl ListenedReceipt {
    pub fn position(&self) -> Position {
        Position::new(self.block_number, self.tx_index)
    }
}

/// Error event surfaced on the merged Errors stream. `position` is the block
/// (and transaction, for receipt failures) that was being fetched.
#[derive(Debug, Clone, Error)]
#[error("error while listening on chain {chain_id} at {position}: {error}")]
pub struct ListenedError {
    pub chain_id: ChainId,
    pub position: Position,
    #[source]
    pub error: ClientError,
}

/// Listening progress of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub current_block: u64,
    pub tx_index: u64,
    /// Highest final block; `None` when the chain head could not be read.
    pub highest_block: Option<u64>,
}
