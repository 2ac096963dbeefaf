use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};
use tx_listener_domain::{
    config::ConfigError, services::TelemetryError, BootstrapConfig, ChainClient, ClientError,
    StartPosition,
};

use crate::retry::RetryingClient;
use crate::rpc::JsonRpcChainClient;
use crate::tx_listener::{ListenerError, ListenerStreams, TxListener};

const RPC_TIMEOUT: Duration = Duration::from_secs(10);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),
    #[error("client error: {0}")]
    Client(#[from] ClientError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// JSON-RPC client for every configured endpoint, wrapped in the configured
/// retry policy.
pub fn build_client(
    config: &BootstrapConfig,
) -> Result<RetryingClient<JsonRpcChainClient>, BootstrapError> {
    let rpc = JsonRpcChainClient::new(config.rpc_urls().clone(), RPC_TIMEOUT)?;
    Ok(RetryingClient::new(rpc, config.listener().retry.clone()))
}

/// Listens to every configured chain until Ctrl-C, logging what the streams
/// deliver, then closes the listener.
pub async fn run_listener<C>(config: BootstrapConfig, client: C) -> Result<(), BootstrapError>
where
    C: ChainClient + 'static,
{
    let (listener, streams) = TxListener::new(client, config.listener().clone());
    let listener = Arc::new(listener);
    let drain = tokio::spawn(drain_streams(streams));

    if let Err(err) = start_sessions(&listener, &config).await {
        listener.close().await;
        let _ = drain.await;
        return Err(err);
    }
    info!(chains = ?listener.chains(), "listener running");

    let mut progress = interval_at(Instant::now() + PROGRESS_INTERVAL, PROGRESS_INTERVAL);
    progress.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal?;
                info!("shutdown requested");
                break;
            }
            _ = progress.tick() => {
                for (chain_id, progress) in listener.progress_all().await {
                    info!(
                        %chain_id,
                        current_block = progress.current_block,
                        tx_index = progress.tx_index,
                        highest_block = ?progress.highest_block,
                        "sync progress"
                    );
                }
            }
        }
    }

    listener.close().await;
    if let Err(err) = drain.await {
        warn!(?err, "stream drain task failed");
    }
    Ok(())
}

async fn start_sessions<C>(
    listener: &TxListener<C>,
    config: &BootstrapConfig,
) -> Result<(), BootstrapError>
where
    C: ChainClient + 'static,
{
    for chain_id in config.rpc_urls().keys().copied() {
        match config.start_position(chain_id) {
            StartPosition::Latest => {
                let start = listener.listen_latest(chain_id).await?;
                info!(%chain_id, %start, "listening from latest final block");
            }
            StartPosition::At(start) => {
                listener.listen(chain_id, start.block_number, start.tx_index)?;
                info!(%chain_id, %start, "listening from configured position");
            }
        }
    }
    Ok(())
}

/// Consumes all three streams until they end.
async fn drain_streams(mut streams: ListenerStreams) {
    let (mut blocks_open, mut receipts_open, mut errors_open) = (true, true, true);
    while blocks_open || receipts_open || errors_open {
        tokio::select! {
            block = streams.blocks.recv(), if blocks_open => match block {
                Some(event) => info!(
                    chain_id = %event.chain_id,
                    number = event.block.number,
                    hash = %event.block.hash,
                    txs = event.block.transactions.len(),
                    "block"
                ),
                None => blocks_open = false,
            },
            receipt = streams.receipts.recv(), if receipts_open => match receipt {
                Some(event) => info!(
                    chain_id = %event.chain_id,
                    position = %event.position(),
                    tx_hash = %event.receipt.tx_hash,
                    status = ?event.receipt.status,
                    gas_used = event.receipt.gas_used,
                    "receipt"
                ),
                None => receipts_open = false,
            },
            error = streams.errors.recv(), if errors_open => match error {
                Some(event) => warn!(
                    chain_id = %event.chain_id,
                    position = %event.position,
                    error = %event.error,
                    kind = event.error.label(),
                    "listener error"
                ),
                None => errors_open = false,
            },
        }
    }
}
