//! Multi-chain transaction listener.
//!
//! A [`TxListener`] attaches one session per chain. Each session polls its
//! chain through a [`BlockCursor`] driven by a [`BlockListener`], fetches the
//! receipts of every transaction in order, and publishes blocks, receipts and
//! errors on three merged streams.

pub mod block_listener;
pub mod cursor;
mod receipts;
pub mod retry;
pub mod rpc;
mod session;
pub mod tracker;
pub mod tx_listener;
pub mod worker;

#[cfg(test)]
mod testing;

pub use block_listener::{BlockListener, BlockStreams, FeederState};
pub use cursor::BlockCursor;
pub use retry::RetryingClient;
pub use rpc::JsonRpcChainClient;
pub use tracker::ChainTracker;
pub use tx_listener::{ListenerError, ListenerStreams, TxListener};
pub use worker::{build_client, run_listener, BootstrapError};
