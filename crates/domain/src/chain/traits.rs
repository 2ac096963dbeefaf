use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Block, ChainId, Header, Receipt, TxHash};

/// Common result alias for chain client calls.
pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The requested block or receipt does not exist yet.
    #[error("not found")]
    NotFound,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("no endpoint configured for chain {0}")]
    UnknownChain(ChainId),
}

impl ClientError {
    /// Transport-level failures worth retrying; everything else is permanent
    /// for the call that produced it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Connection(_) => "connection",
            Self::Timeout(_) => "timeout",
            Self::Rpc { .. } => "rpc",
            Self::Decode(_) => "decode",
            Self::UnknownChain(_) => "unknown_chain",
        }
    }
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Returns `ClientError::NotFound` when the block is not mined yet.
    async fn block_by_number(&self, chain_id: ChainId, number: u64) -> ClientResult<Block>;
    async fn transaction_receipt(&self, chain_id: ChainId, tx_hash: &TxHash)
        -> ClientResult<Receipt>;
    /// `None` requests the latest header.
    async fn header_by_number(&self, chain_id: ChainId, number: Option<u64>)
        -> ClientResult<Header>;
}

#[async_trait]
impl<T> ChainClient for std::sync::Arc<T>
where
    T: ChainClient + ?Sized,
{
    async fn block_by_number(&self, chain_id: ChainId, number: u64) -> ClientResult<Block> {
        (**self).block_by_number(chain_id, number).await
    }

    async fn transaction_receipt(
        &self,
        chain_id: ChainId,
        tx_hash: &TxHash,
    ) -> ClientResult<Receipt> {
        (**self).transaction_receipt(chain_id, tx_hash).await
    }

    async fn header_by_number(
        &self,
        chain_id: ChainId,
        number: Option<u64>,
    ) -> ClientResult<Header> {
        (**self).header_by_number(chain_id, number).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(ClientError::Connection("reset".into()).is_retryable());
        assert!(ClientError::Timeout("5s".into()).is_retryable());
        assert!(!ClientError::NotFound.is_retryable());
        assert!(!ClientError::Decode("bad hex".into()).is_retryable());
        assert!(!ClientError::Rpc {
            code: -32000,
            message: "header not found".into()
        }
        .is_retryable());
    }
}
