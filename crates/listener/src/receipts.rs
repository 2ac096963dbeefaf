//! Receipt fetch pipeline.
//!
//! Every transaction of an observed block gets its own fetch task. Before the
//! task starts, a single-use result slot is queued on the session's response
//! queue, so the queue holds slots in transaction order no matter in which
//! order the network calls complete. One dispatcher drains the queue and waits
//! on each slot in turn, which keeps receipts ordered at the cost of
//! head-of-line blocking.

use std::sync::{Arc, Mutex};

use metrics::counter;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::warn;
use tx_listener_domain::{
    Block, ChainClient, ChainId, ClientError, ClientResult, ListenedError, ListenedReceipt,
    Position, Receipt, TxHash,
};

use crate::session::Outputs;

/// Delivery bookkeeping for one session.
///
/// `current` is the next position the session will deliver. After `set`, the
/// session only accepts the block it was moved to; blocks fetched before the
/// move are dropped, and the requested transaction index applies to that
/// first block only. Every `set` starts a new generation, and work admitted
/// under an older generation no longer moves `current`.
#[derive(Debug)]
pub(crate) struct PositionTracker {
    state: Mutex<PositionState>,
}

#[derive(Debug)]
struct PositionState {
    current: Position,
    resume_tx_index: Option<u64>,
    jump_to: Option<u64>,
    generation: u64,
}

/// A block admitted by [`PositionTracker::accept_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Admission {
    pub(crate) first_tx: u64,
    pub(crate) generation: u64,
}

impl PositionTracker {
    pub(crate) fn new(start: Position) -> Self {
        Self {
            state: Mutex::new(PositionState {
                current: start,
                resume_tx_index: Some(start.tx_index),
                jump_to: None,
                generation: 0,
            }),
        }
    }

    pub(crate) fn current(&self) -> Position {
        self.state.lock().expect("mutex poisoned").current
    }

    pub(crate) fn set(&self, position: Position) {
        let mut state = self.state.lock().expect("mutex poisoned");
        state.current = position;
        state.resume_tx_index = Some(position.tx_index);
        state.jump_to = Some(position.block_number);
        state.generation += 1;
    }

    /// Admits `block_number`, or returns `None` when the block predates the
    /// last `set`.
    pub(crate) fn accept_block(&self, block_number: u64) -> Option<Admission> {
        let mut state = self.state.lock().expect("mutex poisoned");
        match state.jump_to {
            Some(target) if target != block_number => return None,
            Some(_) => state.jump_to = None,
            None => {}
        }
        Some(Admission {
            first_tx: state.resume_tx_index.take().unwrap_or(0),
            generation: state.generation,
        })
    }

    fn delivered(&self, position: Position, generation: u64) {
        let mut state = self.state.lock().expect("mutex poisoned");
        if state.generation == generation {
            state.current = Position::new(position.block_number, position.tx_index + 1);
        }
    }

    fn block_completed(&self, block_number: u64, generation: u64) {
        let mut state = self.state.lock().expect("mutex poisoned");
        if state.generation == generation {
            state.current = Position::new(block_number + 1, 0);
        }
    }
}

struct PendingReceipt {
    block_number: u64,
    block_hash: String,
    tx_index: u64,
    generation: u64,
    slot: oneshot::Receiver<ClientResult<Receipt>>,
}

enum Dispatch {
    Receipt(PendingReceipt),
    BlockEnd { block_number: u64, generation: u64 },
}

/// Submission side of the pipeline, fed by the session intake.
pub(crate) struct ReceiptPipeline<C> {
    client: Arc<C>,
    chain_id: ChainId,
    permits: Arc<Semaphore>,
    queue: mpsc::Sender<Dispatch>,
}

impl<C> ReceiptPipeline<C>
where
    C: ChainClient + 'static,
{
    /// Builds the pipeline and its dispatcher. The dispatcher future ends once
    /// the pipeline is dropped and every queued slot has been delivered.
    pub(crate) fn new(
        client: Arc<C>,
        chain_id: ChainId,
        buffer_limit: usize,
        position: Arc<PositionTracker>,
        outputs: Outputs,
        return_errors: bool,
    ) -> (Self, Dispatcher) {
        let buffer_limit = buffer_limit.max(1);
        let (queue, responses) = mpsc::channel(buffer_limit);
        let pipeline = Self {
            client,
            chain_id,
            permits: Arc::new(Semaphore::new(buffer_limit)),
            queue,
        };
        let dispatcher = Dispatcher {
            chain_id,
            responses,
            position,
            outputs,
            return_errors,
        };
        (pipeline, dispatcher)
    }

    /// Queues a fetch for every transaction of `block` from the admitted
    /// index onwards. Returns `false` once the dispatcher is gone.
    pub(crate) async fn submit(&self, block: &Block, admission: Admission) -> bool {
        let first = usize::try_from(admission.first_tx).unwrap_or(usize::MAX);
        for (index, tx_hash) in block.transactions.iter().enumerate().skip(first) {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                return false;
            };
            let (slot_tx, slot) = oneshot::channel();
            let pending = PendingReceipt {
                block_number: block.number,
                block_hash: block.hash.clone(),
                tx_index: index as u64,
                generation: admission.generation,
                slot,
            };
            if self.queue.send(Dispatch::Receipt(pending)).await.is_err() {
                return false;
            }

            let client = self.client.clone();
            let chain_id = self.chain_id;
            let tx_hash: TxHash = tx_hash.clone();
            tokio::spawn(async move {
                let result = client.transaction_receipt(chain_id, &tx_hash).await;
                let _ = slot_tx.send(result);
                drop(permit);
            });
        }

        self.queue
            .send(Dispatch::BlockEnd {
                block_number: block.number,
                generation: admission.generation,
            })
            .await
            .is_ok()
    }
}

/// Drains the response queue in submission order.
pub(crate) struct Dispatcher {
    chain_id: ChainId,
    responses: mpsc::Receiver<Dispatch>,
    position: Arc<PositionTracker>,
    outputs: Outputs,
    return_errors: bool,
}

impl Dispatcher {
    pub(crate) async fn run(mut self) {
        while let Some(item) = self.responses.recv().await {
            match item {
                Dispatch::Receipt(pending) => self.deliver(pending).await,
                Dispatch::BlockEnd {
                    block_number,
                    generation,
                } => {
                    self.position.block_completed(block_number, generation);
                }
            }
        }
    }

    async fn deliver(&self, pending: PendingReceipt) {
        let chain_id = self.chain_id;
        let position = Position::new(pending.block_number, pending.tx_index);
        let outcome = pending
            .slot
            .await
            .unwrap_or_else(|_| Err(ClientError::Connection("receipt task aborted".into())));

        match outcome {
            Ok(receipt) => {
                counter!("listener_receipts_total", "chain_id" => chain_id.to_string())
                    .increment(1);
                let event = ListenedReceipt {
                    chain_id,
                    block_number: pending.block_number,
                    block_hash: pending.block_hash,
                    tx_index: pending.tx_index,
                    receipt,
                };
                let _ = self.outputs.receipts.send(event).await;
            }
            Err(error) => {
                counter!(
                    "listener_errors_total",
                    "chain_id" => chain_id.to_string(),
                    "stage" => "receipt"
                )
                .increment(1);
                if self.return_errors {
                    let event = ListenedError {
                        chain_id,
                        position,
                        error,
                    };
                    let _ = self.outputs.errors.send(event).await;
                } else {
                    warn!(%chain_id, %position, %error, "failed to fetch receipt");
                }
            }
        }

        self.position.delivered(position, pending.generation);
    }
}
