use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::trace;
use tx_listener_domain::{
    Block, ChainClient, ChainId, ClientError, ClientResult, Header, Receipt, TxHash,
};

mod types;

pub use types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcBlock, RpcReceipt};

/// Ethereum JSON-RPC client over HTTP, one endpoint per chain.
pub struct JsonRpcChainClient {
    http: reqwest::Client,
    endpoints: BTreeMap<ChainId, String>,
    next_id: AtomicU64,
}

impl JsonRpcChainClient {
    pub fn new(endpoints: BTreeMap<ChainId, String>, timeout: Duration) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ClientError::Connection(err.to_string()))?;
        Ok(Self {
            http,
            endpoints,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<P, T>(
        &self,
        chain_id: ChainId,
        method: &'static str,
        params: P,
    ) -> ClientResult<T>
    where
        P: Serialize + Send,
        T: DeserializeOwned,
    {
        let url = self
            .endpoints
            .get(&chain_id)
            .ok_or(ClientError::UnknownChain(chain_id))?;
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        trace!(%chain_id, method, id = request.id, "sending rpc request");

        let response = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ClientError::Connection(format!("{method}: http status {status}")));
        }
        if !status.is_success() {
            return Err(ClientError::Rpc {
                code: i64::from(status.as_u16()),
                message: format!("{method}: http status {status}"),
            });
        }

        let body = response.bytes().await.map_err(transport_error)?;
        decode_response(&body)
    }
}

fn transport_error(err: reqwest::Error) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout(err.to_string())
    } else {
        ClientError::Connection(err.to_string())
    }
}

/// Decodes a JSON-RPC envelope. A `null` result means the object does not
/// exist (yet).
pub fn decode_response<T>(body: &[u8]) -> ClientResult<T>
where
    T: DeserializeOwned,
{
    let response: JsonRpcResponse<T> =
        serde_json::from_slice(body).map_err(|err| ClientError::Decode(err.to_string()))?;
    if let Some(error) = response.error {
        return Err(ClientError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    response.result.ok_or(ClientError::NotFound)
}

fn block_tag(number: Option<u64>) -> String {
    match number {
        Some(number) => format!("{number:#x}"),
        None => "latest".to_string(),
    }
}

#[async_trait]
impl ChainClient for JsonRpcChainClient {
    async fn block_by_number(&self, chain_id: ChainId, number: u64) -> ClientResult<Block> {
        let raw: RpcBlock = self
            .call(chain_id, "eth_getBlockByNumber", json!([block_tag(Some(number)), false]))
            .await?;
        Block::try_from(raw)
    }

    async fn transaction_receipt(
        &self,
        chain_id: ChainId,
        tx_hash: &TxHash,
    ) -> ClientResult<Receipt> {
        let raw: RpcReceipt = self
            .call(chain_id, "eth_getTransactionReceipt", json!([tx_hash.as_str()]))
            .await?;
        Receipt::try_from(raw)
    }

    async fn header_by_number(
        &self,
        chain_id: ChainId,
        number: Option<u64>,
    ) -> ClientResult<Header> {
        let raw: RpcBlock = self
            .call(chain_id, "eth_getBlockByNumber", json!([block_tag(number), false]))
            .await?;
        Header::try_from(raw)
    }
}
