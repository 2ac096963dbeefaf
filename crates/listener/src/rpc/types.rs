use serde::{Deserialize, Serialize};
use tx_listener_domain::{Block, ClientError, Header, Receipt, TxHash};

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<T> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    pub params: T,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// `eth_getBlockByNumber` payload with transaction hashes only.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub number: String,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: String,
    #[serde(default)]
    pub transactions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: String,
    pub transaction_index: String,
    pub block_number: String,
    pub block_hash: String,
    #[serde(default)]
    pub status: Option<String>,
    pub gas_used: String,
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default)]
    pub logs: Vec<serde_json::Value>,
}

/// Parses a `0x`-prefixed hex quantity.
pub fn parse_quantity(field: &str, value: &str) -> Result<u64, ClientError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| ClientError::Decode(format!("{field}: missing 0x prefix in {value}")))?;
    u64::from_str_radix(digits, 16)
        .map_err(|err| ClientError::Decode(format!("{field}: {value}: {err}")))
}

fn parse_hash(field: &str, value: &str) -> Result<TxHash, ClientError> {
    TxHash::parse(value).map_err(|err| ClientError::Decode(format!("{field}: {err}")))
}

impl TryFrom<RpcBlock> for Block {
    type Error = ClientError;

    fn try_from(raw: RpcBlock) -> Result<Self, Self::Error> {
        let transactions = raw
            .transactions
            .iter()
            .map(|tx| parse_hash("transactions", tx))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Block {
            number: parse_quantity("number", &raw.number)?,
            hash: raw.hash,
            parent_hash: raw.parent_hash,
            timestamp: parse_quantity("timestamp", &raw.timestamp)?,
            transactions,
        })
    }
}

impl TryFrom<RpcBlock> for Header {
    type Error = ClientError;

    fn try_from(raw: RpcBlock) -> Result<Self, Self::Error> {
        Ok(Header {
            number: parse_quantity("number", &raw.number)?,
            hash: raw.hash,
            parent_hash: raw.parent_hash,
            timestamp: parse_quantity("timestamp", &raw.timestamp)?,
        })
    }
}

impl TryFrom<RpcReceipt> for Receipt {
    type Error = ClientError;

    fn try_from(raw: RpcReceipt) -> Result<Self, Self::Error> {
        let status = raw
            .status
            .as_deref()
            .map(|status| parse_quantity("status", status).map(|code| code == 1))
            .transpose()?;
        Ok(Receipt {
            tx_hash: parse_hash("transactionHash", &raw.transaction_hash)?,
            transaction_index: parse_quantity("transactionIndex", &raw.transaction_index)?,
            block_number: parse_quantity("blockNumber", &raw.block_number)?,
            block_hash: raw.block_hash,
            status,
            gas_used: parse_quantity("gasUsed", &raw.gas_used)?,
            contract_address: raw.contract_address,
            logs_count: raw.logs.len(),
        })
    }
}
