//! Poll loop turning a [`BlockCursor`] into a live stream of blocks.
//!
//! A single feeder task owns the loop. It wakes up on a coalescing trigger
//! (capacity 1), on a periodic ticker, or on the close signal:
//!
//! ```text
//! Triggered -> Fetching -> Emitted  -> (re-arm trigger) -> Idle
//!                       -> Empty                        -> Idle
//!                       -> Errored  -> (maybe emit)     -> Idle
//! Idle -> Triggered (trigger or tick) | Closed (close signal)
//! ```
//!
//! The feeder is the only owner of the output senders and drops them (blocks,
//! then errors, then the trigger queue) when it leaves the loop, so nothing
//! can be sent on a closed channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use strum_macros::AsRefStr;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, warn};
use tx_listener_domain::{Block, ChainClient, ListenedError, ListenerConfig, Position};

use crate::cursor::BlockCursor;

const MIN_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum FeederState {
    Idle,
    Triggered,
    Fetching,
    Closed,
}

/// Output side of a [`BlockListener`]. Both streams end once the feeder has
/// exited.
pub struct BlockStreams {
    pub blocks: mpsc::Receiver<Arc<Block>>,
    pub errors: mpsc::Receiver<ListenedError>,
}

/// Handle on a running feeder task.
pub struct BlockListener {
    trigger: mpsc::Sender<()>,
    closing: AtomicBool,
    close_signal: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl BlockListener {
    /// Starts the feeder for `cursor`. The first fetch happens immediately.
    pub fn spawn<C>(cursor: Arc<BlockCursor<C>>, config: &ListenerConfig) -> (Self, BlockStreams)
    where
        C: ChainClient + 'static,
    {
        let (blocks_tx, blocks_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (close_signal, closed) = watch::channel(false);

        let period = config.backoff.max(MIN_BACKOFF);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let feeder = Feeder {
            cursor,
            blocks: blocks_tx,
            errors: errors_tx,
            trigger_tx: trigger_tx.clone(),
            trigger_rx,
            ticker,
            closed,
            return_errors: config.return_errors,
        };
        let handle = tokio::spawn(feeder.run());

        let listener = Self {
            trigger: trigger_tx,
            closing: AtomicBool::new(false),
            close_signal,
            handle: Some(handle),
        };
        let streams = BlockStreams {
            blocks: blocks_rx,
            errors: errors_rx,
        };
        (listener, streams)
    }

    /// Asks the feeder to poll now. Returns `false` when a wake-up is already
    /// pending (or the feeder is gone); never blocks.
    pub fn trigger(&self) -> bool {
        try_trigger(&self.trigger)
    }

    /// Signals the feeder to stop. Only the first call has an effect; it
    /// returns `true`.
    pub fn close(&self) -> bool {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.close_signal.send_replace(true);
        true
    }

    /// Waits for the feeder task to exit.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                error!(?err, "block feeder task failed");
            }
        }
    }
}

pub(crate) fn try_trigger(trigger: &mpsc::Sender<()>) -> bool {
    trigger.try_send(()).is_ok()
}

struct Feeder<C> {
    cursor: Arc<BlockCursor<C>>,
    blocks: mpsc::Sender<Arc<Block>>,
    errors: mpsc::Sender<ListenedError>,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: mpsc::Receiver<()>,
    ticker: Interval,
    closed: watch::Receiver<bool>,
    return_errors: bool,
}

impl<C> Feeder<C>
where
    C: ChainClient,
{
    async fn run(mut self) {
        let chain_id = self.cursor.chain_id();
        debug!(%chain_id, start = self.cursor.height(), "block feeder started");

        let mut state = FeederState::Triggered;
        loop {
            state = match state {
                FeederState::Idle => self.wait().await,
                FeederState::Triggered => FeederState::Fetching,
                FeederState::Fetching => self.fetch().await,
                FeederState::Closed => break,
            };
        }

        let Self {
            blocks,
            errors,
            trigger_rx,
            ..
        } = self;
        drop(blocks);
        drop(errors);
        drop(trigger_rx);
        debug!(%chain_id, state = FeederState::Closed.as_ref(), "block feeder stopped");
    }

    async fn wait(&mut self) -> FeederState {
        tokio::select! {
            biased;
            _ = self.closed.wait_for(|closed| *closed) => FeederState::Closed,
            _ = self.trigger_rx.recv() => FeederState::Triggered,
            _ = self.ticker.tick() => FeederState::Triggered,
        }
    }

    async fn fetch(&mut self) -> FeederState {
        let chain_id = self.cursor.chain_id();
        let height = self.cursor.height();

        match self.cursor.next().await {
            Ok(Some(block)) => {
                counter!("listener_blocks_total", "chain_id" => chain_id.to_string()).increment(1);
                if !self.emit_block(Arc::new(block)).await {
                    return FeederState::Closed;
                }
                // Drain any backlog without waiting for the next tick.
                try_trigger(&self.trigger_tx);
                FeederState::Idle
            }
            Ok(None) => FeederState::Idle,
            Err(error) => {
                counter!(
                    "listener_errors_total",
                    "chain_id" => chain_id.to_string(),
                    "stage" => "block"
                )
                .increment(1);
                if self.return_errors {
                    let error = ListenedError {
                        chain_id,
                        position: Position::new(height, 0),
                        error,
                    };
                    if !self.emit_error(error).await {
                        return FeederState::Closed;
                    }
                } else {
                    warn!(%chain_id, height, %error, "failed to fetch block");
                }
                FeederState::Idle
            }
        }
    }

    async fn emit_block(&mut self, block: Arc<Block>) -> bool {
        tokio::select! {
            biased;
            _ = self.closed.wait_for(|closed| *closed) => false,
            sent = self.blocks.send(block) => sent.is_ok(),
        }
    }

    async fn emit_error(&mut self, error: ListenedError) -> bool {
        tokio::select! {
            biased;
            _ = self.closed.wait_for(|closed| *closed) => false,
            sent = self.errors.send(error) => sent.is_ok(),
        }
    }
}
