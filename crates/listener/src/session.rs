use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use tx_listener_domain::{
    Block, ChainClient, ChainId, ListenedBlock, ListenedError, ListenedReceipt, ListenerConfig,
    Position, Progress,
};

use crate::block_listener::{BlockListener, BlockStreams};
use crate::cursor::BlockCursor;
use crate::receipts::{PositionTracker, ReceiptPipeline};
use crate::tracker::ChainTracker;
use crate::tx_listener::ListenerStreams;

/// Sending halves of the shared output streams. Every session holds a clone;
/// a stream ends once all clones are gone.
#[derive(Clone)]
pub(crate) struct Outputs {
    pub(crate) blocks: mpsc::Sender<ListenedBlock>,
    pub(crate) receipts: mpsc::Sender<ListenedReceipt>,
    pub(crate) errors: mpsc::Sender<ListenedError>,
}

impl Outputs {
    pub(crate) fn channel() -> (Self, ListenerStreams) {
        let (blocks_tx, blocks) = mpsc::channel(1);
        let (receipts_tx, receipts) = mpsc::channel(1);
        let (errors_tx, errors) = mpsc::channel(1);
        let outputs = Self {
            blocks: blocks_tx,
            receipts: receipts_tx,
            errors: errors_tx,
        };
        let streams = ListenerStreams {
            blocks,
            receipts,
            errors,
        };
        (outputs, streams)
    }
}

/// Everything one chain needs: cursor, feeder, intake relay and receipt
/// dispatcher.
pub(crate) struct Session<C> {
    chain_id: ChainId,
    cursor: Arc<BlockCursor<Arc<C>>>,
    listener: BlockListener,
    tracker: ChainTracker<Arc<C>>,
    position: Arc<PositionTracker>,
    tasks: Vec<JoinHandle<()>>,
}

impl<C> Session<C>
where
    C: ChainClient + 'static,
{
    pub(crate) fn start(
        client: Arc<C>,
        chain_id: ChainId,
        start: Position,
        config: &ListenerConfig,
        outputs: Outputs,
    ) -> Self {
        let cursor = Arc::new(BlockCursor::new(
            client.clone(),
            chain_id,
            start.block_number,
        ));
        let (listener, streams) = BlockListener::spawn(cursor.clone(), config);
        let position = Arc::new(PositionTracker::new(start));
        let (pipeline, dispatcher) = ReceiptPipeline::new(
            client.clone(),
            chain_id,
            config.buffer_limit,
            position.clone(),
            outputs.clone(),
            config.return_errors,
        );
        let intake = Intake {
            chain_id,
            streams,
            pipeline,
            position: position.clone(),
            outputs,
            return_blocks: config.return_blocks,
        };
        let tasks = vec![tokio::spawn(dispatcher.run()), tokio::spawn(intake.run())];

        info!(%chain_id, %start, "session started");
        Self {
            chain_id,
            cursor,
            listener,
            tracker: ChainTracker::new(client, chain_id, config.depth),
            position,
            tasks,
        }
    }

    /// Moves the session to `position` and wakes the feeder.
    pub(crate) fn set(&self, position: Position) {
        self.position.set(position);
        self.cursor.set(position.block_number);
        self.listener.trigger();
        info!(chain_id = %self.chain_id, %position, "session moved");
    }

    pub(crate) fn probe(&self) -> SessionProbe<C> {
        SessionProbe {
            tracker: self.tracker.clone(),
            position: self.position.clone(),
        }
    }

    pub(crate) fn close(&self) -> bool {
        self.listener.close()
    }

    /// Waits for the feeder, the intake relay and the dispatcher to exit.
    pub(crate) async fn join(mut self) {
        self.listener.join().await;
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                error!(chain_id = %self.chain_id, ?err, "session task failed");
            }
        }
        info!(chain_id = %self.chain_id, "session stopped");
    }
}

/// Detached view used to report progress without holding the registry lock.
pub(crate) struct SessionProbe<C> {
    tracker: ChainTracker<Arc<C>>,
    position: Arc<PositionTracker>,
}

impl<C> SessionProbe<C>
where
    C: ChainClient,
{
    pub(crate) async fn progress(&self) -> Progress {
        let current = self.position.current();
        let highest_block = match self.tracker.highest_block().await {
            Ok(number) => Some(number),
            Err(err) => {
                debug!(chain_id = %self.tracker.chain_id(), %err, "chain head unavailable");
                None
            }
        };
        Progress {
            current_block: current.block_number,
            tx_index: current.tx_index,
            highest_block,
        }
    }
}

/// Relays feeder output into the shared streams and the receipt pipeline.
struct Intake<C> {
    chain_id: ChainId,
    streams: BlockStreams,
    pipeline: ReceiptPipeline<C>,
    position: Arc<PositionTracker>,
    outputs: Outputs,
    return_blocks: bool,
}

impl<C> Intake<C>
where
    C: ChainClient + 'static,
{
    async fn run(mut self) {
        loop {
            tokio::select! {
                block = self.streams.blocks.recv() => match block {
                    Some(block) => {
                        if !self.handle_block(block).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(error) = self.streams.errors.recv() => {
                    let _ = self.outputs.errors.send(error).await;
                }
            }
        }

        // The feeder may still hold one error when the blocks stream ends.
        while let Some(error) = self.streams.errors.recv().await {
            let _ = self.outputs.errors.send(error).await;
        }
        debug!(chain_id = %self.chain_id, "intake stopped");
    }

    async fn handle_block(&self, block: Arc<Block>) -> bool {
        let Some(admission) = self.position.accept_block(block.number) else {
            debug!(
                chain_id = %self.chain_id,
                number = block.number,
                "dropping block fetched before move"
            );
            return true;
        };

        if self.return_blocks {
            let event = ListenedBlock {
                chain_id: self.chain_id,
                block: block.clone(),
                observed_at: Utc::now(),
            };
            let _ = self.outputs.blocks.send(event).await;
        }
        self.pipeline.submit(&block, admission).await
    }
}
