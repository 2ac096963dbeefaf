use std::sync::atomic::{AtomicU64, Ordering};

use metrics::gauge;
use tx_listener_domain::{Block, ChainClient, ChainId, ClientError, ClientResult};

/// Strictly sequential pointer over the block heights of one chain.
///
/// The height only moves forward when a block is actually returned, so a run
/// of "not mined yet" answers or client failures keeps asking for the same
/// block.
pub struct BlockCursor<C> {
    client: C,
    chain_id: ChainId,
    next: AtomicU64,
}

impl<C> BlockCursor<C>
where
    C: ChainClient,
{
    pub fn new(client: C, chain_id: ChainId, start: u64) -> Self {
        Self {
            client,
            chain_id,
            next: AtomicU64::new(start),
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Height the next call to [`BlockCursor::next`] will request.
    pub fn height(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    /// Overwrites the next height. Must not race with an in-flight `next`.
    pub fn set(&self, height: u64) {
        self.next.store(height, Ordering::Release);
        gauge!("listener_cursor_height", "chain_id" => self.chain_id.to_string())
            .set(height as f64);
    }

    /// Requests the block at the current height.
    ///
    /// Returns `Ok(None)` when the block is not mined yet and `Err` on any
    /// other failure; neither advances the cursor.
    pub async fn next(&self) -> ClientResult<Option<Block>> {
        let number = self.height();
        match self.client.block_by_number(self.chain_id, number).await {
            Ok(block) => {
                // A concurrent `set` wins over the advance.
                if self
                    .next
                    .compare_exchange(number, number + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    gauge!("listener_cursor_height", "chain_id" => self.chain_id.to_string())
                        .set((number + 1) as f64);
                }
                Ok(Some(block))
            }
            Err(ClientError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
