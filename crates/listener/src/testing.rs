//! In-memory chain client used by the unit and scenario tests.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tx_listener_domain::{
    Block, ChainClient, ChainId, ClientError, ClientResult, Header, Receipt, TxHash,
};

#[derive(Default)]
struct MockState {
    blocks: HashMap<(ChainId, u64), Block>,
    receipts: HashMap<TxHash, Receipt>,
    block_failures: HashMap<(ChainId, u64), (usize, ClientError)>,
    receipt_failures: HashMap<TxHash, (usize, ClientError)>,
    receipt_delays: HashMap<TxHash, Duration>,
    block_calls: HashMap<(ChainId, u64), usize>,
    receipt_calls: HashMap<TxHash, usize>,
}

#[derive(Default)]
pub(crate) struct MockChainClient {
    state: Mutex<MockState>,
}

pub(crate) fn tx_hash(chain_id: ChainId, block: u64, index: u64) -> TxHash {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&chain_id.get().to_be_bytes());
    bytes[8..16].copy_from_slice(&block.to_be_bytes());
    bytes[16..24].copy_from_slice(&index.to_be_bytes());
    TxHash::from_bytes(bytes)
}

fn block_hash(chain_id: ChainId, number: u64) -> String {
    format!("0x{:032x}{:032x}", chain_id.get(), number)
}

impl MockChainClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Mines every block in `numbers`, each carrying `txs` transactions.
    pub(crate) fn mine(&self, chain_id: ChainId, numbers: RangeInclusive<u64>, txs: u64) {
        let mut state = self.state.lock().expect("mutex poisoned");
        for number in numbers {
            let hash = block_hash(chain_id, number);
            let transactions: Vec<TxHash> = (0..txs)
                .map(|index| tx_hash(chain_id, number, index))
                .collect();
            for (index, tx) in transactions.iter().enumerate() {
                state.receipts.insert(
                    tx.clone(),
                    Receipt {
                        tx_hash: tx.clone(),
                        transaction_index: index as u64,
                        block_number: number,
                        block_hash: hash.clone(),
                        status: Some(true),
                        gas_used: 21_000,
                        contract_address: None,
                        logs_count: 0,
                    },
                );
            }
            state.blocks.insert(
                (chain_id, number),
                Block {
                    number,
                    hash,
                    parent_hash: block_hash(chain_id, number.saturating_sub(1)),
                    timestamp: 1_700_000_000 + number * 12,
                    transactions,
                },
            );
        }
    }

    /// Fails the next `times` lookups of block `number`.
    pub(crate) fn fail_block(
        &self,
        chain_id: ChainId,
        number: u64,
        times: usize,
        err: ClientError,
    ) {
        let mut state = self.state.lock().expect("mutex poisoned");
        state.block_failures.insert((chain_id, number), (times, err));
    }

    pub(crate) fn fail_receipt(&self, tx: &TxHash, times: usize, err: ClientError) {
        let mut state = self.state.lock().expect("mutex poisoned");
        state.receipt_failures.insert(tx.clone(), (times, err));
    }

    pub(crate) fn delay_receipt(&self, tx: &TxHash, delay: Duration) {
        let mut state = self.state.lock().expect("mutex poisoned");
        state.receipt_delays.insert(tx.clone(), delay);
    }

    pub(crate) fn block_calls(&self, chain_id: ChainId, number: u64) -> usize {
        let state = self.state.lock().expect("mutex poisoned");
        state
            .block_calls
            .get(&(chain_id, number))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn receipt_calls(&self, tx: &TxHash) -> usize {
        let state = self.state.lock().expect("mutex poisoned");
        state.receipt_calls.get(tx).copied().unwrap_or(0)
    }
}

fn take_failure<K>(failures: &mut HashMap<K, (usize, ClientError)>, key: &K) -> Option<ClientError>
where
    K: std::hash::Hash + Eq,
{
    let (remaining, err) = failures.get_mut(key)?;
    if *remaining == 0 {
        return None;
    }
    *remaining -= 1;
    Some(err.clone())
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn block_by_number(&self, chain_id: ChainId, number: u64) -> ClientResult<Block> {
        let mut state = self.state.lock().expect("mutex poisoned");
        *state.block_calls.entry((chain_id, number)).or_default() += 1;
        if let Some(err) = take_failure(&mut state.block_failures, &(chain_id, number)) {
            return Err(err);
        }
        state
            .blocks
            .get(&(chain_id, number))
            .cloned()
            .ok_or(ClientError::NotFound)
    }

    async fn transaction_receipt(
        &self,
        _chain_id: ChainId,
        tx_hash: &TxHash,
    ) -> ClientResult<Receipt> {
        let (result, delay) = {
            let mut state = self.state.lock().expect("mutex poisoned");
            *state.receipt_calls.entry(tx_hash.clone()).or_default() += 1;
            let result = match take_failure(&mut state.receipt_failures, tx_hash) {
                Some(err) => Err(err),
                None => state
                    .receipts
                    .get(tx_hash)
                    .cloned()
                    .ok_or(ClientError::NotFound),
            };
            (result, state.receipt_delays.get(tx_hash).copied())
        };

        if let Some(delay) = delay {
            sleep(delay).await;
        }
        result
    }

    async fn header_by_number(
        &self,
        chain_id: ChainId,
        number: Option<u64>,
    ) -> ClientResult<Header> {
        let state = self.state.lock().expect("mutex poisoned");
        let block = match number {
            Some(number) => state.blocks.get(&(chain_id, number)),
            None => state
                .blocks
                .iter()
                .filter(|((chain, _), _)| *chain == chain_id)
                .max_by_key(|((_, number), _)| *number)
                .map(|(_, block)| block),
        }
        .ok_or(ClientError::NotFound)?;

        Ok(Header {
            number: block.number,
            hash: block.hash.clone(),
            parent_hash: block.parent_hash.clone(),
            timestamp: block.timestamp,
        })
    }
}
