use tx_listener_domain::{ChainClient, ChainId, ClientResult};

/// Reports the highest block of a chain considered final, i.e. `depth` blocks
/// behind the head.
#[derive(Clone)]
pub struct ChainTracker<C> {
    client: C,
    chain_id: ChainId,
    depth: u64,
}

impl<C> ChainTracker<C>
where
    C: ChainClient,
{
    pub fn new(client: C, chain_id: ChainId, depth: u64) -> Self {
        Self {
            client,
            chain_id,
            depth,
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub async fn highest_block(&self) -> ClientResult<u64> {
        let head = self.client.header_by_number(self.chain_id, None).await?;
        Ok(head.number.saturating_sub(self.depth))
    }
}
