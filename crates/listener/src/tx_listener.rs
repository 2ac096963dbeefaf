use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use metrics::gauge;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;
use tx_listener_domain::{
    ChainClient, ChainId, ClientError, ListenedBlock, ListenedError, ListenedReceipt,
    ListenerConfig, Position, Progress,
};

use crate::session::{Outputs, Session};
use crate::tracker::ChainTracker;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ListenerError {
    #[error("chain {0} already being listened")]
    AlreadyListening(ChainId),
    #[error("listener has been closed")]
    Closed,
    #[error("chain {0} is not being listened")]
    UnknownChain(ChainId),
    #[error("failed to resolve chain tip: {0}")]
    Client(#[from] ClientError),
}

/// Merged output streams of a [`TxListener`]. Each stream ends once
/// [`TxListener::close`] has returned.
pub struct ListenerStreams {
    pub blocks: mpsc::Receiver<ListenedBlock>,
    pub receipts: mpsc::Receiver<ListenedReceipt>,
    pub errors: mpsc::Receiver<ListenedError>,
}

/// Manages one listening session per chain and merges their output.
///
/// Streams have a capacity of one event; consumers must keep draining every
/// stream they enabled in [`ListenerConfig`], otherwise the sessions stall and
/// [`TxListener::close`] waits for them.
pub struct TxListener<C> {
    client: Arc<C>,
    config: ListenerConfig,
    sessions: Mutex<HashMap<ChainId, Session<C>>>,
    outputs: Mutex<Option<Outputs>>,
    closed: AtomicBool,
    closing: tokio::sync::Mutex<()>,
    /// Held shared by `stop` while it winds a detached session down, and
    /// exclusively by `close` before it ends the shared streams.
    detaching: tokio::sync::RwLock<()>,
}

impl<C> TxListener<C>
where
    C: ChainClient + 'static,
{
    pub fn new(client: C, config: ListenerConfig) -> (Self, ListenerStreams) {
        let (outputs, streams) = Outputs::channel();
        let listener = Self {
            client: Arc::new(client),
            config,
            sessions: Mutex::new(HashMap::new()),
            outputs: Mutex::new(Some(outputs)),
            closed: AtomicBool::new(false),
            closing: tokio::sync::Mutex::new(()),
            detaching: tokio::sync::RwLock::new(()),
        };
        (listener, streams)
    }

    /// Starts listening to `chain_id` from block `block_number`, skipping the
    /// first `tx_index` transactions of that block.
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen(
        &self,
        chain_id: ChainId,
        block_number: u64,
        tx_index: u64,
    ) -> Result<(), ListenerError> {
        let mut sessions = self.sessions.lock().expect("mutex poisoned");
        if self.closed.load(Ordering::Acquire) {
            return Err(ListenerError::Closed);
        }
        if sessions.contains_key(&chain_id) {
            return Err(ListenerError::AlreadyListening(chain_id));
        }
        let outputs = self
            .outputs
            .lock()
            .expect("mutex poisoned")
            .clone()
            .ok_or(ListenerError::Closed)?;

        let session = Session::start(
            self.client.clone(),
            chain_id,
            Position::new(block_number, tx_index),
            &self.config,
            outputs,
        );
        sessions.insert(chain_id, session);
        gauge!("listener_active_sessions").set(sessions.len() as f64);
        Ok(())
    }

    /// Starts listening to `chain_id` from its highest final block, that is
    /// the head minus the configured depth.
    pub async fn listen_latest(&self, chain_id: ChainId) -> Result<Position, ListenerError> {
        self.ensure_available(chain_id)?;
        let tracker = ChainTracker::new(self.client.clone(), chain_id, self.config.depth);
        let start = Position::new(tracker.highest_block().await?, 0);
        self.listen(chain_id, start.block_number, start.tx_index)?;
        Ok(start)
    }

    /// Moves the session of `chain_id` to `block_number`. The transaction
    /// offset only applies to that first block.
    pub fn set(
        &self,
        chain_id: ChainId,
        block_number: u64,
        tx_index: u64,
    ) -> Result<(), ListenerError> {
        let sessions = self.sessions.lock().expect("mutex poisoned");
        if self.closed.load(Ordering::Acquire) {
            return Err(ListenerError::Closed);
        }
        let session = sessions
            .get(&chain_id)
            .ok_or(ListenerError::UnknownChain(chain_id))?;
        session.set(Position::new(block_number, tx_index));
        Ok(())
    }

    pub fn chains(&self) -> BTreeSet<ChainId> {
        self.sessions
            .lock()
            .expect("mutex poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub async fn progress(&self, chain_id: ChainId) -> Result<Progress, ListenerError> {
        let probe = self
            .sessions
            .lock()
            .expect("mutex poisoned")
            .get(&chain_id)
            .map(Session::probe)
            .ok_or(ListenerError::UnknownChain(chain_id))?;
        Ok(probe.progress().await)
    }

    pub async fn progress_all(&self) -> BTreeMap<ChainId, Progress> {
        let probes: Vec<_> = self
            .sessions
            .lock()
            .expect("mutex poisoned")
            .iter()
            .map(|(chain_id, session)| (*chain_id, session.probe()))
            .collect();

        let mut progress = BTreeMap::new();
        for (chain_id, probe) in probes {
            progress.insert(chain_id, probe.progress().await);
        }
        progress
    }

    /// Detaches the session of `chain_id` and waits for it to wind down. The
    /// shared streams stay open; a concurrent [`TxListener::close`] waits for
    /// the detached session too.
    pub async fn stop(&self, chain_id: ChainId) -> Result<(), ListenerError> {
        let _detaching = self.detaching.read().await;
        let session = {
            let mut sessions = self.sessions.lock().expect("mutex poisoned");
            let session = sessions
                .remove(&chain_id)
                .ok_or(ListenerError::UnknownChain(chain_id))?;
            gauge!("listener_active_sessions").set(sessions.len() as f64);
            session
        };
        session.close();
        session.join().await;
        Ok(())
    }

    /// Stops every session, waits for all of them, then ends the shared
    /// streams. Later calls return once the first one has finished.
    pub async fn close(&self) {
        let _closing = self.closing.lock().await;
        let sessions: Vec<_> = {
            let mut sessions = self.sessions.lock().expect("mutex poisoned");
            if self.closed.swap(true, Ordering::AcqRel) && sessions.is_empty() {
                return;
            }
            sessions.drain().map(|(_, session)| session).collect()
        };

        info!(sessions = sessions.len(), "closing listener");
        for session in &sessions {
            session.close();
        }
        for session in sessions {
            session.join().await;
        }
        drop(self.detaching.write().await);

        drop(self.outputs.lock().expect("mutex poisoned").take());
        gauge!("listener_active_sessions").set(0.0);
        info!("listener closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_available(&self, chain_id: ChainId) -> Result<(), ListenerError> {
        let sessions = self.sessions.lock().expect("mutex poisoned");
        if self.closed.load(Ordering::Acquire) {
            return Err(ListenerError::Closed);
        }
        if sessions.contains_key(&chain_id) {
            return Err(ListenerError::AlreadyListening(chain_id));
        }
        Ok(())
    }
}
