use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use metrics::counter;
use tracing::warn;
use tx_listener_domain::{
    Block, ChainClient, ChainId, ClientError, ClientResult, Header, Receipt, RetryConfig, TxHash,
};

/// Wraps a [`ChainClient`] so that transport failures are retried with
/// exponential backoff before reaching the listener.
///
/// `NotFound` and RPC-level errors are returned on the first attempt.
pub struct RetryingClient<C> {
    inner: C,
    config: RetryConfig,
}

impl<C> RetryingClient<C>
where
    C: ChainClient,
{
    pub fn new(inner: C, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    fn policy(&self) -> ExponentialBuilder {
        let policy = ExponentialBuilder::default()
            .with_min_delay(self.config.initial_interval)
            .with_factor(self.config.multiplier.max(1.0))
            .with_max_delay(self.config.max_interval)
            .with_total_delay(Some(self.config.max_elapsed_time))
            .with_max_times(usize::MAX);
        if self.config.randomization_factor > 0.0 {
            policy.with_jitter()
        } else {
            policy
        }
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        chain_id: ChainId,
        f: F,
    ) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        f.retry(self.policy())
            .when(ClientError::is_retryable)
            .notify(|err: &ClientError, delay: Duration| {
                counter!(
                    "listener_rpc_retries_total",
                    "chain_id" => chain_id.to_string(),
                    "operation" => operation
                )
                .increment(1);
                warn!(%chain_id, operation, %err, ?delay, "chain client call failed, retrying");
            })
            .sleep(tokio::time::sleep)
            .await
    }
}

#[async_trait]
impl<C> ChainClient for RetryingClient<C>
where
    C: ChainClient,
{
    async fn block_by_number(&self, chain_id: ChainId, number: u64) -> ClientResult<Block> {
        self.call("block_by_number", chain_id, || {
            self.inner.block_by_number(chain_id, number)
        })
        .await
    }

    async fn transaction_receipt(
        &self,
        chain_id: ChainId,
        tx_hash: &TxHash,
    ) -> ClientResult<Receipt> {
        self.call("transaction_receipt", chain_id, || {
            self.inner.transaction_receipt(chain_id, tx_hash)
        })
        .await
    }

    async fn header_by_number(
        &self,
        chain_id: ChainId,
        number: Option<u64>,
    ) -> ClientResult<Header> {
        self.call("header_by_number", chain_id, || {
            self.inner.header_by_number(chain_id, number)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tx_hash, MockChainClient};
    use backon::BackoffBuilder;
    use std::sync::Arc;
    use std::time::Instant;

    const CHAIN: ChainId = ChainId::new(5);

    fn fast_policy(max_elapsed_time: Duration) -> RetryConfig {
        RetryConfig {
            initial_interval: Duration::from_millis(1),
            multiplier: 1.5,
            randomization_factor: 0.0,
            max_interval: Duration::from_millis(5),
            max_elapsed_time,
        }
    }

    #[tokio::test]
    async fn retries_transport_errors_until_success() {
        let mock = Arc::new(MockChainClient::new());
        mock.mine(CHAIN, 1..=1, 1);
        mock.fail_block(CHAIN, 1, 3, ClientError::Connection("reset".into()));
        mock.fail_receipt(
            &tx_hash(CHAIN, 1, 0),
            2,
            ClientError::Timeout("deadline".into()),
        );
        let client = RetryingClient::new(mock.clone(), fast_policy(Duration::from_secs(5)));

        let block = client.block_by_number(CHAIN, 1).await.expect("block");
        assert_eq!(block.number, 1);
        assert_eq!(mock.block_calls(CHAIN, 1), 4);

        let receipt = client
            .transaction_receipt(CHAIN, &tx_hash(CHAIN, 1, 0))
            .await
            .expect("receipt");
        assert_eq!(receipt.block_number, 1);
        assert_eq!(mock.receipt_calls(&tx_hash(CHAIN, 1, 0)), 3);
    }

    #[tokio::test]
    async fn not_found_and_rpc_errors_are_not_retried() {
        let mock = Arc::new(MockChainClient::new());
        mock.mine(CHAIN, 1..=1, 0);
        mock.fail_block(
            CHAIN,
            1,
            1,
            ClientError::Rpc {
                code: -32602,
                message: "invalid argument".into(),
            },
        );
        let client = RetryingClient::new(mock.clone(), fast_policy(Duration::from_secs(5)));

        assert_eq!(
            client.block_by_number(CHAIN, 2).await,
            Err(ClientError::NotFound)
        );
        assert_eq!(mock.block_calls(CHAIN, 2), 1);

        assert!(matches!(
            client.block_by_number(CHAIN, 1).await,
            Err(ClientError::Rpc { code: -32602, .. })
        ));
        assert_eq!(mock.block_calls(CHAIN, 1), 1);
    }

    #[tokio::test]
    async fn gives_up_once_the_time_budget_is_spent() {
        let mock = Arc::new(MockChainClient::new());
        mock.mine(CHAIN, 1..=1, 0);
        mock.fail_block(CHAIN, 1, usize::MAX, ClientError::Connection("down".into()));
        let client = RetryingClient::new(mock.clone(), fast_policy(Duration::from_millis(50)));

        let started = Instant::now();
        let result = client.block_by_number(CHAIN, 1).await;
        assert_eq!(result, Err(ClientError::Connection("down".into())));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(mock.block_calls(CHAIN, 1) > 1);
    }

    #[test]
    fn zero_randomization_keeps_delays_exact() {
        let client =
            RetryingClient::new(MockChainClient::new(), fast_policy(Duration::from_secs(5)));
        let delays: Vec<Duration> = client.policy().build().take(6).collect();

        assert_eq!(delays.len(), 6);
        assert_eq!(delays[0], Duration::from_millis(1));
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(delays[5], Duration::from_millis(5));
    }
}
